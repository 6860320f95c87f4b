//! Multi-agent crowd simulation on navigation meshes
//!
//! This crate moves groups of agents over a shared [`navmesh::NavMesh`]. Each
//! agent follows a polygon corridor toward its target, steers around
//! neighbours and walls with sampled velocity avoidance, and stays on the
//! surface by moving through its corridor.
//!
//! # Example
//!
//! ```rust,ignore
//! use glam::Vec3;
//! use navmesh_crowd::{AgentParams, Crowd, CrowdConfig};
//!
//! let mut crowd = Crowd::new(&nav_mesh, CrowdConfig::new(32, 0.6))?;
//!
//! let params = AgentParams {
//!     radius: 0.6,
//!     max_speed: 3.5,
//!     ..Default::default()
//! };
//! let agent = crowd.add_agent(Vec3::new(1.0, 0.0, 1.0), params)?;
//! crowd.request_move(agent, Vec3::new(20.0, 0.0, 12.0))?;
//!
//! for _ in 0..100 {
//!     crowd.update(1.0 / 30.0)?;
//! }
//! println!("{:?}", crowd.agent(agent));
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent slots and the per-tick update
//! - [`PathCorridor`]: the polygon corridor an agent follows
//! - [`LocalBoundary`]: nearby wall segments
//! - [`ObstacleAvoidanceQuery`]: sampled velocity avoidance
//! - [`AvoidanceProfiles`]: preset avoidance quality levels
//! - [`ProximityGrid`]: spatial hash for neighbour lookups

pub mod avoidance_profiles;
pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

pub use avoidance_profiles::*;
pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;

/// Version of the crowd data model reported by [`Crowd::version`]
pub const VERSION: i32 = 1;

#[cfg(test)]
mod test_mesh;
