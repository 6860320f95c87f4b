//! Crowd management
//!
//! [`Crowd`] owns a fixed array of agent slots on a shared navigation mesh.
//! Each [`Crowd::update`] advances every active agent once, always in
//! ascending slot order.

use glam::Vec3;
use log::{debug, trace, warn};

use crate::{
    AvoidanceProfiles, LocalBoundary, ObstacleAvoidanceQuery, PathCorridor, ProximityGrid,
    MAX_AVOIDANCE_PROFILES, MAX_LOCAL_SEGS,
};
use nav_common::{clamp_length, dist_2d, dist_sqr_2d, sqr, tri_area_2d, Error, Result};
use navmesh::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, StraightPath, StraightPathFlags};

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
pub const MAX_CORNERS: usize = 4;

/// The maximum number of query filter types supported by the crowd manager.
pub const MAX_QUERY_FILTER_TYPES: usize = 16;

/// Longest corridor an agent keeps
const MAX_PATH_RESULT: usize = 256;

/// Corridor polygons re-validated every tick
const CHECK_LOOKAHEAD: usize = 10;

/// Seconds before a corridor that stops short of its target is searched again
const TARGET_REPLAN_DELAY: f32 = 1.0;

/// Seconds between topology optimizations of one agent
const OPT_TIME_THR: f32 = 0.5;

/// Agents whose corridor topology is optimized per tick
const OPT_MAX_AGENTS: usize = 1;

const COLLISION_RESOLVE_ITERS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;

bitflags::bitflags! {
    /// Per-agent steering behaviours
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct UpdateFlags: u8 {
        /// Steer toward the corner after next to round turns
        const ANTICIPATE_TURNS = 0x01;
        /// Sample velocities around neighbours and walls
        const OBSTACLE_AVOIDANCE = 0x02;
        /// Push away from nearby agents
        const SEPARATION = 0x04;
        /// Shortcut the corridor toward visible corners
        const OPTIMIZE_VIS = 0x08;
        /// Periodically search the corridor again for a shorter route
        const OPTIMIZE_TOPO = 0x10;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// The type of navigation mesh polygon the agent is currently traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not on the mesh.
    #[default]
    Invalid,
    /// The agent is traversing a normal navigation mesh polygon.
    Walking,
    /// The agent is traversing an off-mesh connection.
    OffMesh,
}

/// Move request state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    None,
    /// Waiting for the next tick to plan a corridor
    Requested,
    Valid,
    /// No corridor could be planned or the target left the mesh
    Failed,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct AgentParams {
    /// Radius of the agent
    pub radius: f32,
    /// Height of the agent
    pub height: f32,
    /// Maximum acceleration of the agent
    pub max_acceleration: f32,
    /// Maximum speed of the agent
    pub max_speed: f32,
    /// Neighbours and walls within this distance affect steering
    pub collision_query_range: f32,
    /// Reach of corridor visibility shortcuts
    pub path_optimization_range: f32,
    /// How strongly the agent pushes away from neighbours
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index into the crowd's [`AvoidanceProfiles`]
    pub obstacle_avoidance_type: u8,
    /// Index of the crowd query filter the agent uses
    pub query_filter_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: 0.5,
            height: 2.0,
            max_acceleration: 20.0,
            max_speed: 5.0,
            collision_query_range: 6.0,
            path_optimization_range: 15.0,
            separation_weight: 1.0,
            update_flags: UpdateFlags::all(),
            obstacle_avoidance_type: 1,
            query_filter_type: 0,
        }
    }
}

impl AgentParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0) || !self.radius.is_finite() {
            return Err(Error::InvalidParam(format!(
                "agent radius must be positive, got {}",
                self.radius
            )));
        }
        if !(self.height > 0.0) || !self.height.is_finite() {
            return Err(Error::InvalidParam(format!(
                "agent height must be positive, got {}",
                self.height
            )));
        }
        if !(self.max_speed >= 0.0) || !self.max_speed.is_finite() {
            return Err(Error::InvalidParam(format!(
                "agent max speed must not be negative, got {}",
                self.max_speed
            )));
        }
        if !(self.max_acceleration >= 0.0) {
            return Err(Error::InvalidParam(format!(
                "agent max acceleration must not be negative, got {}",
                self.max_acceleration
            )));
        }
        if !(self.collision_query_range >= 0.0) || !(self.path_optimization_range >= 0.0) {
            return Err(Error::InvalidParam("agent query ranges must not be negative".to_string()));
        }
        if self.obstacle_avoidance_type as usize >= MAX_AVOIDANCE_PROFILES {
            return Err(Error::InvalidParam(format!(
                "avoidance profile {} out of range 0..{MAX_AVOIDANCE_PROFILES}",
                self.obstacle_avoidance_type
            )));
        }
        if self.query_filter_type as usize >= MAX_QUERY_FILTER_TYPES {
            return Err(Error::InvalidParam(format!(
                "query filter {} out of range 0..{MAX_QUERY_FILTER_TYPES}",
                self.query_filter_type
            )));
        }
        Ok(())
    }
}

/// Crowd sizing
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CrowdConfig {
    /// Number of agent slots
    pub max_agents: usize,
    /// Largest agent radius the crowd is tuned for
    pub max_agent_radius: f32,
    /// Half extents of the box used to snap agents and targets to the mesh
    pub query_extents: Vec3,
    /// Node budget of the crowd's path searches
    pub max_query_nodes: usize,
}

impl CrowdConfig {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Self {
        Self {
            max_agents,
            max_agent_radius,
            query_extents: Vec3::new(
                max_agent_radius * 2.0,
                max_agent_radius * 1.5,
                max_agent_radius * 2.0,
            ),
            max_query_nodes: 512,
        }
    }

    /// Loads a config from JSON; missing fields keep their defaults
    #[cfg(feature = "serialization")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidParam(format!("crowd config: {e}")))
    }
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self::new(128, 0.6)
    }
}

/// Read-only view of one agent slot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AgentSnapshot {
    pub index: usize,
    pub active: bool,
    pub state: CrowdAgentState,
    pub target_state: TargetState,
    /// The corridor does not reach the target or the last move was clamped
    pub partial: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    pub desired_velocity: Vec3,
    pub desired_speed: f32,
    /// Polygon under the agent
    pub poly_ref: PolyRef,
    pub target_ref: PolyRef,
    pub target_position: Vec3,
}

#[derive(Debug, Clone, Copy)]
struct Neighbour {
    idx: usize,
    dist_sqr: f32,
}

#[derive(Debug, Clone, Copy)]
struct OffMeshAnim {
    init_pos: Vec3,
    start_pos: Vec3,
    end_pos: Vec3,
    poly_ref: PolyRef,
    t: f32,
    t_max: f32,
}

#[derive(Debug, Clone)]
struct CrowdAgent {
    active: bool,
    state: CrowdAgentState,
    /// The planned corridor stops short of the target
    path_partial: bool,
    /// The last surface move was stopped by a wall
    clamped: bool,
    corridor: PathCorridor,
    boundary: LocalBoundary,
    topology_opt_time: f32,
    neis: Vec<Neighbour>,
    desired_speed: f32,
    npos: Vec3,
    disp: Vec3,
    dvel: Vec3,
    nvel: Vec3,
    vel: Vec3,
    params: AgentParams,
    corners: StraightPath,
    target_state: TargetState,
    target_ref: PolyRef,
    target_pos: Vec3,
    target_replan_time: f32,
    anim: Option<OffMeshAnim>,
}

impl CrowdAgent {
    fn new() -> Self {
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            path_partial: false,
            clamped: false,
            corridor: PathCorridor::new(MAX_PATH_RESULT),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::with_capacity(MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            disp: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params: AgentParams::default(),
            corners: StraightPath::default(),
            target_state: TargetState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            target_replan_time: 0.0,
            anim: None,
        }
    }

    fn has_target(&self) -> bool {
        self.target_state == TargetState::Valid
    }

    fn snapshot(&self, index: usize) -> AgentSnapshot {
        AgentSnapshot {
            index,
            active: self.active,
            state: self.state,
            target_state: self.target_state,
            partial: self.path_partial || self.clamped,
            position: self.npos,
            velocity: self.vel,
            desired_velocity: self.dvel,
            desired_speed: self.desired_speed,
            poly_ref: self.corridor.first_poly(),
            target_ref: self.target_ref,
            target_position: self.target_pos,
        }
    }
}

/// Crowd simulator over a shared navigation mesh
///
/// The crowd borrows the mesh, so tiles cannot be added or removed while it
/// exists.
#[derive(Debug)]
pub struct Crowd<'a> {
    nav_mesh: &'a NavMesh,
    query: NavMeshQuery<'a>,
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    active_count: usize,
    filters: [QueryFilter; MAX_QUERY_FILTER_TYPES],
    profiles: AvoidanceProfiles,
    obstacle_query: ObstacleAvoidanceQuery,
    grid: ProximityGrid,
}

impl<'a> Crowd<'a> {
    /// Creates a crowd with `config.max_agents` empty slots
    pub fn new(nav_mesh: &'a NavMesh, config: CrowdConfig) -> Result<Self> {
        if config.max_agents == 0 {
            return Err(Error::InvalidParam("crowd needs at least one agent slot".to_string()));
        }
        if !(config.max_agent_radius > 0.0) {
            return Err(Error::InvalidParam(format!(
                "max agent radius must be positive, got {}",
                config.max_agent_radius
            )));
        }
        let query = NavMeshQuery::new(nav_mesh, config.max_query_nodes)?;

        debug!(
            "crowd created: {} slots, max agent radius {}",
            config.max_agents, config.max_agent_radius
        );

        Ok(Self {
            nav_mesh,
            query,
            agents: (0..config.max_agents).map(|_| CrowdAgent::new()).collect(),
            active_count: 0,
            filters: std::array::from_fn(|_| QueryFilter::default()),
            profiles: AvoidanceProfiles::new(),
            obstacle_query: ObstacleAvoidanceQuery::new(MAX_NEIGHBOURS, MAX_LOCAL_SEGS),
            grid: ProximityGrid::new(config.max_agent_radius * 3.0),
            config,
        })
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    pub fn max_agents(&self) -> usize {
        self.agents.len()
    }

    /// Number of active agents
    pub fn agent_count(&self) -> usize {
        self.active_count
    }

    pub fn version(&self) -> i32 {
        crate::VERSION
    }

    pub fn profiles(&self) -> &AvoidanceProfiles {
        &self.profiles
    }

    pub fn filter(&self, idx: usize) -> Option<&QueryFilter> {
        self.filters.get(idx)
    }

    pub fn filter_mut(&mut self, idx: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(idx)
    }

    fn warn_oversized(&self, params: &AgentParams) {
        if params.radius > self.config.max_agent_radius {
            warn!(
                "agent radius {} exceeds the crowd maximum {}",
                params.radius, self.config.max_agent_radius
            );
        }
    }

    fn active_agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        let len = self.agents.len();
        match self.agents.get_mut(idx) {
            Some(ag) if ag.active => Ok(ag),
            Some(_) => Err(Error::InvalidHandle(format!("agent {idx} is not active"))),
            None => Err(Error::InvalidHandle(format!(
                "agent {idx} out of range 0..{len}"
            ))),
        }
    }

    /// Adds an agent at the free slot with the lowest index.
    ///
    /// The agent is snapped to the nearest polygon; without one in reach it
    /// is added in the [`CrowdAgentState::Invalid`] state.
    pub fn add_agent(&mut self, position: Vec3, params: AgentParams) -> Result<usize> {
        params.validate()?;
        let Some(idx) = self.agents.iter().position(|ag| !ag.active) else {
            return Err(Error::CapacityExceeded(format!(
                "all {} agent slots are in use",
                self.agents.len()
            )));
        };
        self.warn_oversized(&params);

        let filter = &self.filters[params.query_filter_type as usize];
        let (poly_ref, nearest) = self
            .query
            .find_nearest_poly(&position, &self.config.query_extents, filter)
            .unwrap_or((PolyRef::NULL, position));

        let ag = &mut self.agents[idx];
        *ag = CrowdAgent::new();
        ag.corridor.reset(poly_ref, nearest);
        ag.npos = nearest;
        ag.params = params;
        ag.state = if poly_ref.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        ag.active = true;
        self.active_count += 1;

        debug!("agent {idx} added at {nearest} on {poly_ref}");
        Ok(idx)
    }

    /// Deactivates the agent in slot `idx`.
    ///
    /// Returns whether an active agent was removed; inactive or out-of-range
    /// slots are left alone.
    pub fn remove_agent(&mut self, idx: usize) -> bool {
        match self.agents.get_mut(idx) {
            Some(ag) if ag.active => {
                *ag = CrowdAgent::new();
                self.active_count -= 1;
                debug!("agent {idx} removed");
                true
            }
            _ => false,
        }
    }

    pub fn set_agent_params(&mut self, idx: usize, params: AgentParams) -> Result<()> {
        params.validate()?;
        self.warn_oversized(&params);
        self.active_agent_mut(idx)?.params = params;
        Ok(())
    }

    pub fn agent_params(&self, idx: usize) -> Option<AgentParams> {
        self.agents
            .get(idx)
            .filter(|ag| ag.active)
            .map(|ag| ag.params.clone())
    }

    /// Nearest polygon to `position` within the crowd's query extents
    pub fn get_nearest_poly(&self, position: Vec3) -> Result<(PolyRef, Vec3)> {
        self.query
            .find_nearest_poly(&position, &self.config.query_extents, &self.filters[0])
    }

    /// Requests a move toward `position`, snapped to the nearest polygon.
    ///
    /// The corridor is planned on the next [`update`](Self::update).
    pub fn request_move(&mut self, idx: usize, position: Vec3) -> Result<()> {
        let filter_type = self.active_agent_mut(idx)?.params.query_filter_type as usize;
        let (poly_ref, nearest) = self
            .query
            .find_nearest_poly(&position, &self.config.query_extents, &self.filters[filter_type])
            .map_err(|e| {
                debug!("agent {idx}: move request rejected: {e}");
                e
            })?;
        self.set_move_target(idx, poly_ref, nearest)
    }

    /// Requests a move toward `position` on a caller chosen polygon
    pub fn request_move_by_poly(
        &mut self,
        idx: usize,
        poly_ref: PolyRef,
        position: Vec3,
    ) -> Result<()> {
        self.active_agent_mut(idx)?;
        if !self.nav_mesh.is_valid_poly_ref(poly_ref) {
            debug!("agent {idx}: move request rejected, {poly_ref} is not loaded");
            return Err(Error::NotFound(format!("{poly_ref} is not loaded")));
        }
        self.set_move_target(idx, poly_ref, position)
    }

    fn set_move_target(&mut self, idx: usize, poly_ref: PolyRef, position: Vec3) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = poly_ref;
        ag.target_pos = position;
        ag.target_state = TargetState::Requested;
        ag.target_replan_time = 0.0;
        Ok(())
    }

    pub fn agent(&self, idx: usize) -> Option<AgentSnapshot> {
        self.agents
            .get(idx)
            .filter(|ag| ag.active)
            .map(|ag| ag.snapshot(idx))
    }

    /// Snapshots of every active agent in slot order
    pub fn active_agents(&self) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, ag)| ag.active)
            .map(|(i, ag)| ag.snapshot(i))
            .collect()
    }

    /// Writes active agent snapshots into `out` in slot order.
    ///
    /// Returns the number written. When more agents are active than `out`
    /// holds, `out` is filled and `BufferTooSmall` reports both counts.
    pub fn active_agents_into(&self, out: &mut [AgentSnapshot]) -> Result<usize> {
        let mut written = 0;
        for (i, ag) in self.agents.iter().enumerate().filter(|(_, ag)| ag.active) {
            let Some(slot) = out.get_mut(written) else {
                break;
            };
            *slot = ag.snapshot(i);
            written += 1;
        }
        if written < self.active_count {
            return Err(Error::BufferTooSmall {
                written,
                required: self.active_count,
            });
        }
        Ok(written)
    }

    /// Advances the simulation by `dt` seconds
    pub fn update(&mut self, dt: f32) -> Result<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(Error::InvalidParam(format!(
                "time step must be a non-negative number, got {dt}"
            )));
        }

        let active: Vec<usize> = (0..self.agents.len())
            .filter(|&i| self.agents[i].active)
            .collect();

        self.check_path_validity(&active, dt);
        self.update_move_requests(&active);
        self.update_topology_optimization(&active, dt);
        self.update_neighbourhoods(&active);
        self.update_corners(&active);
        self.trigger_off_mesh_connections(&active);
        self.calc_desired_velocities(&active);
        self.plan_velocities(&active);
        self.apply_separation(&active);
        self.integrate(&active, dt);
        self.resolve_collisions(&active);
        self.move_along_surface(&active);
        self.update_off_mesh_animations(&active, dt);

        trace!("crowd tick of {dt}s over {} agents", active.len());
        Ok(())
    }

    /// Re-resolves agents and targets whose polygons went stale and flags
    /// corridors that need a new search
    fn check_path_validity(&mut self, active: &[usize], dt: f32) {
        let nav_mesh = self.nav_mesh;
        let extents = self.config.query_extents;

        for &idx in active {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type as usize];

            // Off-mesh agents rejoin once a polygon comes back in reach
            if ag.state == CrowdAgentState::Invalid {
                match self.query.find_nearest_poly(&ag.npos, &extents, filter) {
                    Ok((r, nearest)) => {
                        ag.corridor.reset(r, nearest);
                        ag.boundary.reset();
                        ag.npos = nearest;
                        ag.state = CrowdAgentState::Walking;
                        debug!("agent {idx} back on the mesh at {nearest} on {r}");
                    }
                    Err(_) => {
                        if ag.target_state == TargetState::Requested {
                            ag.target_state = TargetState::Failed;
                            debug!("agent {idx}: move request failed, agent is off the mesh");
                        }
                        continue;
                    }
                }
            }
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            ag.target_replan_time += dt;
            let mut replan = false;

            let mut agent_ref = ag.corridor.first_poly();
            let mut agent_pos = ag.npos;
            if !passes_filter(nav_mesh, agent_ref, filter) {
                match self.query.find_nearest_poly(&ag.npos, &extents, filter) {
                    Ok((r, nearest)) => {
                        agent_ref = r;
                        agent_pos = nearest;
                        ag.corridor.fix_path_start(r, nearest);
                        ag.boundary.reset();
                        ag.npos = nearest;
                        replan = true;
                    }
                    Err(_) => {
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.path_partial = false;
                        ag.boundary.reset();
                        ag.state = CrowdAgentState::Invalid;
                        if matches!(ag.target_state, TargetState::Requested | TargetState::Valid) {
                            ag.target_state = TargetState::Failed;
                        }
                        debug!("agent {idx} left the mesh at {agent_pos}");
                        continue;
                    }
                }
            }

            if matches!(ag.target_state, TargetState::None | TargetState::Failed) {
                continue;
            }

            if !passes_filter(nav_mesh, ag.target_ref, filter) {
                match self.query.find_nearest_poly(&ag.target_pos, &extents, filter) {
                    Ok((r, nearest)) => {
                        ag.target_ref = r;
                        ag.target_pos = nearest;
                        replan = true;
                    }
                    Err(_) => {
                        ag.corridor.reset(agent_ref, agent_pos);
                        ag.path_partial = false;
                        ag.target_state = TargetState::Failed;
                        debug!("agent {idx}: target {} is no longer on the mesh", ag.target_pos);
                        continue;
                    }
                }
            }

            if !ag.corridor.is_valid(CHECK_LOOKAHEAD, nav_mesh, filter) {
                if let Err(e) = ag
                    .corridor
                    .trim_invalid_path(agent_ref, agent_pos, nav_mesh, filter)
                {
                    debug!("agent {idx}: corridor trim failed: {e}");
                    ag.corridor.reset(agent_ref, agent_pos);
                }
                replan = true;
            }

            if ag.target_state == TargetState::Valid
                && ag.target_replan_time > TARGET_REPLAN_DELAY
                && ag.corridor.path_count() < CHECK_LOOKAHEAD
                && ag.corridor.last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != TargetState::Requested {
                debug!("agent {idx}: replanning toward {}", ag.target_pos);
                ag.target_state = TargetState::Requested;
                ag.target_replan_time = 0.0;
            }
        }
    }

    /// Plans corridors for requested targets
    fn update_move_requests(&mut self, active: &[usize]) {
        let nav_mesh = self.nav_mesh;

        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking || ag.target_state != TargetState::Requested {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            let start_ref = ag.corridor.first_poly();
            match self
                .query
                .find_path(start_ref, ag.target_ref, &ag.npos, &ag.target_pos, filter)
            {
                Ok(path) => {
                    let reached = !path.partial && path.last() == Some(ag.target_ref);
                    let req_pos = match path.last() {
                        Some(_) if reached => ag.target_pos,
                        Some(last) => nav_mesh
                            .closest_point_on_poly(last, &ag.target_pos)
                            .map_or(ag.npos, |(p, _)| p),
                        None => ag.npos,
                    };
                    ag.corridor.set_corridor(req_pos, &path.polys);
                    ag.boundary.reset();
                    ag.path_partial = !reached;
                    ag.target_state = TargetState::Valid;
                    ag.target_replan_time = 0.0;
                    debug!(
                        "agent {idx}: corridor of {} polygons{}",
                        path.polys.len(),
                        if reached { "" } else { " (partial)" }
                    );
                }
                Err(e) => {
                    ag.path_partial = false;
                    ag.target_state = TargetState::Failed;
                    debug!("agent {idx}: move request failed: {e}");
                }
            }
        }
    }

    /// Searches the corridors of the agents that waited longest again
    fn update_topology_optimization(&mut self, active: &[usize], dt: f32) {
        let mut queue = Vec::new();
        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking
                || !ag.has_target()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= OPT_TIME_THR {
                queue.push(idx);
            }
        }

        queue.sort_by(|&a, &b| {
            self.agents[b]
                .topology_opt_time
                .total_cmp(&self.agents[a].topology_opt_time)
        });

        for idx in queue.into_iter().take(OPT_MAX_AGENTS) {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            match ag.corridor.optimize_path_topology(&mut self.query, filter) {
                Ok(true) => trace!("agent {idx}: corridor topology shortened"),
                Ok(false) => {}
                Err(e) => debug!("agent {idx}: topology optimization failed: {e}"),
            }
            ag.topology_opt_time = 0.0;
        }
    }

    /// Refreshes wall boundaries and neighbour lists
    fn update_neighbourhoods(&mut self, active: &[usize]) {
        self.grid.clear();
        for &idx in active {
            let ag = &self.agents[idx];
            let (p, r) = (ag.npos, ag.params.radius);
            self.grid.add_item(idx, p.x - r, p.z - r, p.x + r, p.z + r);
        }

        for &idx in active {
            if self.agents[idx].state != CrowdAgentState::Walking {
                continue;
            }
            let neis = find_neighbours(idx, &self.agents, &self.grid);

            let ag = &mut self.agents[idx];
            ag.neis = neis;

            let filter = &self.filters[ag.params.query_filter_type as usize];
            let range = ag.params.collision_query_range;
            let moved_away = ag
                .boundary
                .center()
                .map_or(true, |c| dist_sqr_2d(&ag.npos, &c) > sqr(range * 0.25));
            if moved_away || !ag.boundary.is_valid(&self.query, filter) {
                if let Err(e) = ag
                    .boundary
                    .update(ag.corridor.first_poly(), ag.npos, range, &self.query, filter)
                {
                    debug!("agent {idx}: boundary update failed: {e}");
                    ag.boundary.reset();
                }
            }
        }
    }

    /// Finds the corners to steer to and shortcuts visible ones
    fn update_corners(&mut self, active: &[usize]) {
        for &idx in active {
            let ag = &mut self.agents[idx];
            ag.corners = StraightPath::default();
            if ag.state != CrowdAgentState::Walking || !ag.has_target() {
                continue;
            }

            match ag.corridor.find_corners(MAX_CORNERS, &self.query) {
                Ok(corners) => ag.corners = corners,
                Err(e) => {
                    debug!("agent {idx}: corner search failed: {e}");
                    continue;
                }
            }

            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS)
                && !ag.corners.is_empty()
            {
                let next = ag.corners.points[1.min(ag.corners.len() - 1)].pos;
                let filter = &self.filters[ag.params.query_filter_type as usize];
                if let Err(e) = ag.corridor.optimize_path_visibility(
                    next,
                    ag.params.path_optimization_range,
                    &self.query,
                    filter,
                ) {
                    debug!("agent {idx}: visibility optimization failed: {e}");
                }
            }
        }
    }

    /// Starts the traversal of off-mesh connections agents have reached
    fn trigger_off_mesh_connections(&mut self, active: &[usize]) {
        let nav_mesh = self.nav_mesh;

        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking || !ag.has_target() {
                continue;
            }
            let Some(last) = ag.corners.points.last().copied() else {
                continue;
            };
            let trigger_radius = ag.params.radius * 2.25;
            if !last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                || dist_sqr_2d(&ag.npos, &last.pos) >= sqr(trigger_radius)
            {
                continue;
            }

            match ag.corridor.move_over_offmesh_connection(last.poly, nav_mesh) {
                Ok((_, start_pos, end_pos)) => {
                    let t_max = if ag.params.max_speed > 0.0 {
                        dist_2d(&start_pos, &end_pos) / ag.params.max_speed * 0.5
                    } else {
                        0.0
                    };
                    ag.anim = Some(OffMeshAnim {
                        init_pos: ag.npos,
                        start_pos,
                        end_pos,
                        poly_ref: last.poly,
                        t: 0.0,
                        t_max,
                    });
                    ag.state = CrowdAgentState::OffMesh;
                    ag.corners = StraightPath::default();
                    ag.neis.clear();
                    debug!("agent {idx} entering off-mesh connection {}", last.poly);
                }
                // Bad connections are replanned by the validity check
                Err(e) => debug!("agent {idx}: off-mesh connection {} unusable: {e}", last.poly),
            }
        }
    }

    /// Steers toward the next corner, slowing down near the goal
    fn calc_desired_velocities(&mut self, active: &[usize]) {
        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            if !ag.has_target() {
                ag.desired_speed = 0.0;
                ag.dvel = Vec3::ZERO;
                continue;
            }

            let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                smooth_steer_direction(ag.npos, &ag.corners)
            } else {
                straight_steer_direction(ag.npos, &ag.corners)
            };

            let slow_down_radius = ag.params.radius * 2.0;
            let speed_scale =
                distance_to_goal(ag.npos, &ag.corners, slow_down_radius) / slow_down_radius;
            ag.desired_speed = ag.params.max_speed;
            ag.dvel = dir * (ag.desired_speed * speed_scale);
        }
    }

    /// Samples a collision free velocity around the desired one
    fn plan_velocities(&mut self, active: &[usize]) {
        for &idx in active {
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            let profile = self.profiles.get(ag.params.obstacle_avoidance_type as usize).copied();
            let nvel = match profile {
                Some(params)
                    if ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE)
                        && ag.desired_speed > 0.0 =>
                {
                    self.obstacle_query.reset();
                    for nei in &ag.neis {
                        let other = &self.agents[nei.idx];
                        self.obstacle_query
                            .add_circle(other.npos, other.params.radius, other.vel, other.dvel);
                    }
                    // Only walls facing the agent
                    for seg in ag.boundary.segments() {
                        if tri_area_2d(&ag.npos, &seg.p, &seg.q) < 0.0 {
                            continue;
                        }
                        self.obstacle_query.add_segment(seg.p, seg.q);
                    }

                    let sample = self.obstacle_query.sample_velocity_adaptive(
                        ag.npos,
                        ag.params.radius,
                        ag.desired_speed,
                        ag.vel,
                        ag.dvel,
                        &params,
                    );
                    trace!("agent {idx}: {} avoidance samples", sample.samples);
                    sample.velocity
                }
                _ => ag.dvel,
            };
            self.agents[idx].nvel = nvel;
        }
    }

    /// Pushes the planned velocity away from close neighbours
    fn apply_separation(&mut self, active: &[usize]) {
        for &idx in active {
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking
                || !ag.params.update_flags.contains(UpdateFlags::SEPARATION)
            {
                continue;
            }

            let separation_dist = ag.params.collision_query_range;
            if !(separation_dist > 0.0) {
                continue;
            }
            let inv_separation_dist = 1.0 / separation_dist;

            let mut disp = Vec3::ZERO;
            let mut w = 0.0;
            for nei in &ag.neis {
                let other = &self.agents[nei.idx];
                let mut diff = ag.npos - other.npos;
                diff.y = 0.0;
                let dist_sqr = diff.length_squared();
                if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                    continue;
                }
                let dist = dist_sqr.sqrt();
                let weight = ag.params.separation_weight * (1.0 - sqr(dist * inv_separation_dist));
                disp += diff * (weight / dist);
                w += 1.0;
            }

            if w > 0.0001 {
                let nvel = clamp_length(ag.nvel + disp * (1.0 / w), ag.desired_speed);
                self.agents[idx].nvel = nvel;
            }
        }
    }

    /// Accelerates toward the planned velocity and moves freely
    fn integrate(&mut self, active: &[usize], dt: f32) {
        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            let max_delta = ag.params.max_acceleration * dt;
            let dv = clamp_length(ag.nvel - ag.vel, max_delta);
            ag.vel = clamp_length(ag.vel + dv, ag.params.max_speed);

            if ag.vel.length() > 0.0001 {
                ag.npos += ag.vel * dt;
            } else {
                ag.vel = Vec3::ZERO;
            }
        }
    }

    /// Separates overlapping agents
    fn resolve_collisions(&mut self, active: &[usize]) {
        for _ in 0..COLLISION_RESOLVE_ITERS {
            for &idx in active {
                let ag = &self.agents[idx];
                if ag.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut disp = Vec3::ZERO;
                let mut w = 0.0;
                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;
                    let dist_sqr = diff.length_squared();
                    let r = ag.params.radius + other.params.radius;
                    if dist_sqr > sqr(r) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // On top of each other; pick diverging directions
                        diff = if idx > nei.idx {
                            Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
                        } else {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((r - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
                    };
                    disp += diff * pen;
                    w += 1.0;
                }
                if w > 0.0001 {
                    disp *= 1.0 / w;
                }
                self.agents[idx].disp = disp;
            }

            for &idx in active {
                let ag = &mut self.agents[idx];
                if ag.state == CrowdAgentState::Walking {
                    ag.npos += ag.disp;
                }
            }
        }
    }

    /// Constrains the moved positions to the surface through the corridors
    fn move_along_surface(&mut self, active: &[usize]) {
        for &idx in active {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            match ag.corridor.move_position(ag.npos, &self.query, filter) {
                Ok(reached) => ag.clamped = !reached,
                Err(e) => {
                    debug!("agent {idx}: surface move failed: {e}");
                    ag.clamped = true;
                }
            }
            ag.npos = ag.corridor.pos();

            // Without a corridor to follow, keep just the current polygon
            if !ag.has_target() && ag.target_state != TargetState::Requested {
                let current = ag.corridor.first_poly();
                ag.corridor.reset(current, ag.npos);
                ag.path_partial = false;
            }
        }
    }

    /// Moves agents along the off-mesh connections they are traversing
    fn update_off_mesh_animations(&mut self, active: &[usize], dt: f32) {
        for &idx in active {
            let ag = &mut self.agents[idx];
            let Some(mut anim) = ag.anim else {
                continue;
            };

            anim.t += dt;
            if anim.t > anim.t_max {
                ag.anim = None;
                ag.state = CrowdAgentState::Walking;
                ag.npos = anim.end_pos;
                debug!("agent {idx} left off-mesh connection {}", anim.poly_ref);
                continue;
            }

            let ta = anim.t_max * 0.15;
            let tb = anim.t_max;
            ag.npos = if anim.t < ta {
                anim.init_pos.lerp(anim.start_pos, tween(anim.t, 0.0, ta))
            } else {
                anim.start_pos.lerp(anim.end_pos, tween(anim.t, ta, tb))
            };
            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
            ag.anim = Some(anim);
        }
    }
}

fn passes_filter(nav_mesh: &NavMesh, reference: PolyRef, filter: &QueryFilter) -> bool {
    nav_mesh
        .get_tile_and_poly_by_ref(reference)
        .map(|(_, poly)| filter.pass_filter(poly))
        .unwrap_or(false)
}

/// Closest active agents within collision range, nearest first
fn find_neighbours(idx: usize, agents: &[CrowdAgent], grid: &ProximityGrid) -> Vec<Neighbour> {
    let ag = &agents[idx];
    let pos = ag.npos;
    let range = ag.params.collision_query_range;

    let mut result: Vec<Neighbour> = Vec::with_capacity(MAX_NEIGHBOURS);
    // Every candidate is ranked; the grid must not cut them by slot id
    let candidates = grid.query_items(
        pos.x - range,
        pos.z - range,
        pos.x + range,
        pos.z + range,
        agents.len(),
    );
    for id in candidates {
        if id == idx {
            continue;
        }
        let Some(other) = agents.get(id).filter(|a| a.active) else {
            continue;
        };

        let diff = pos - other.npos;
        if diff.y.abs() >= (ag.params.height + other.params.height) / 2.0 {
            continue;
        }
        let dist_sqr = sqr(diff.x) + sqr(diff.z);
        if dist_sqr > sqr(range) {
            continue;
        }

        let at = result.partition_point(|n| n.dist_sqr <= dist_sqr);
        if at < MAX_NEIGHBOURS {
            result.insert(at, Neighbour { idx: id, dist_sqr });
            result.truncate(MAX_NEIGHBOURS);
        }
    }
    result
}

fn straight_steer_direction(pos: Vec3, corners: &StraightPath) -> Vec3 {
    let Some(first) = corners.points.first() else {
        return Vec3::ZERO;
    };
    let mut dir = first.pos - pos;
    dir.y = 0.0;
    dir.normalize_or_zero()
}

/// Blends the directions to the next two corners to round the turn
fn smooth_steer_direction(pos: Vec3, corners: &StraightPath) -> Vec3 {
    if corners.is_empty() {
        return Vec3::ZERO;
    }
    let p0 = corners.points[0].pos;
    let p1 = corners.points[1.min(corners.len() - 1)].pos;

    let mut dir0 = p0 - pos;
    let mut dir1 = p1 - pos;
    dir0.y = 0.0;
    dir1.y = 0.0;

    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 *= 1.0 / len1;
    }

    Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5).normalize_or_zero()
}

/// Distance to the end of the path, capped at `range` when the end is not
/// among the corners
fn distance_to_goal(pos: Vec3, corners: &StraightPath, range: f32) -> f32 {
    match corners.points.last() {
        Some(last) if last.flags.contains(StraightPathFlags::END) => {
            dist_2d(&pos, &last.pos).min(range)
        }
        _ => range,
    }
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= 0.0 {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}
