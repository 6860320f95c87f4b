//! Spatial query tests on single-tile meshes

use glam::Vec3;

use crate::test_mesh_helpers::{islands_mesh, single_tile_mesh};
use crate::{
    NavMesh, NavMeshQuery, NavQuerySettings, PolyFlags, PolyRef, QueryFilter, StraightPathFlags,
    TileBuilder,
};
use nav_common::{Error, Result};

fn poly(mesh: &NavMesh, i: usize) -> PolyRef {
    mesh.encode_poly_ref(0, i)
}

fn approx(a: Vec3, b: Vec3) -> bool {
    a.distance(b) < 1e-3
}

/// Five unit cells forming an L: along x to (3, 1), then up to z = 3
fn l_shape_mesh() -> Result<NavMesh> {
    let mut builder = TileBuilder::new(0, 0, Vec3::ZERO, Vec3::new(3.0, 0.0, 3.0));
    for (x, z) in [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (2.0, 1.0), (2.0, 2.0)] {
        builder.add_polygon(
            &[
                Vec3::new(x, 0.0, z),
                Vec3::new(x, 0.0, z + 1.0),
                Vec3::new(x + 1.0, 0.0, z + 1.0),
                Vec3::new(x + 1.0, 0.0, z),
            ],
            0,
            PolyFlags::WALK,
        )?;
    }
    let mut mesh = NavMesh::init(3.0, 4, 8)?;
    mesh.add_tile(&builder.to_bytes()?)?;
    Ok(mesh)
}

#[test]
fn test_find_nearest_poly() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let (r, p) = query.find_nearest_poly(&Vec3::new(1.5, 0.5, 0.5), &Vec3::ONE, &filter)?;
    assert_eq!(r, poly(&mesh, 1));
    assert!(approx(p, Vec3::new(1.5, 0.0, 0.5)));

    let far = query.find_nearest_poly(&Vec3::new(50.0, 0.0, 50.0), &Vec3::ONE, &filter);
    assert!(matches!(far, Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_nearest_poly_respects_filter() -> Result<()> {
    let mesh = single_tile_mesh(2)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter {
        include_flags: PolyFlags::SWIM,
        ..Default::default()
    };
    let r = query.find_nearest_poly(&Vec3::new(1.0, 0.0, 1.0), &Vec3::ONE, &filter);
    assert!(r.unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn test_sample_and_location() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let p = query.sample_position(&Vec3::new(1.5, 0.3, 1.5), &Vec3::ONE, &filter)?;
    assert!(approx(p, Vec3::new(1.5, 0.0, 1.5)));

    let p = query.get_location(&Vec3::new(1.5, 5.0, 1.5), &Vec3::new(1.0, 10.0, 1.0), &filter)?;
    assert!(approx(p, Vec3::new(1.5, 0.0, 1.5)));

    let h = query.poly_height(poly(&mesh, 4), &Vec3::new(1.5, 3.0, 1.5))?;
    assert!(h.abs() < 1e-4);
    assert!(query.poly_height(poly(&mesh, 0), &Vec3::new(1.5, 0.0, 1.5)).is_err());
    Ok(())
}

#[test]
fn test_find_path_along_row() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(2.5, 0.0, 0.5);
    let path = query.find_path(poly(&mesh, 0), poly(&mesh, 2), &start, &end, &filter)?;
    assert!(!path.partial);
    assert_eq!(path.polys, vec![poly(&mesh, 0), poly(&mesh, 1), poly(&mesh, 2)]);

    let straight = query.straight_path_along(&start, &end, &path.polys, 16)?;
    assert_eq!(straight.len(), 2);
    assert!(approx(straight.points[0].pos, start));
    assert_eq!(straight.points[0].flags, StraightPathFlags::START);
    assert!(approx(straight.points[1].pos, end));
    assert_eq!(straight.points[1].flags, StraightPathFlags::END);
    Ok(())
}

#[test]
fn test_find_path_corner_to_corner() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(2.5, 0.0, 2.5);
    let path = query.find_path(poly(&mesh, 0), poly(&mesh, 8), &start, &end, &filter)?;
    assert!(!path.partial);
    assert_eq!(path.polys.first(), Some(&poly(&mesh, 0)));
    assert_eq!(path.last(), Some(poly(&mesh, 8)));
    assert!(path.polys.len() >= 5);
    for pair in path.polys.windows(2) {
        assert!(query.get_portal_points(pair[0], pair[1]).is_ok());
    }
    Ok(())
}

#[test]
fn test_same_poly_path() -> Result<()> {
    let mesh = single_tile_mesh(2)?;
    let mut query = NavMeshQuery::new(&mesh, 16)?;
    let p = Vec3::new(0.5, 0.0, 0.5);
    let path = query.find_path(poly(&mesh, 0), poly(&mesh, 0), &p, &p, &QueryFilter::default())?;
    assert_eq!(path.polys, vec![poly(&mesh, 0)]);
    Ok(())
}

#[test]
fn test_straight_path_turns_at_corner() -> Result<()> {
    let mesh = l_shape_mesh()?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(2.5, 0.0, 2.5);
    let straight =
        query.find_straight_path(poly(&mesh, 0), &start, poly(&mesh, 4), &end, &filter, 16)?;
    assert!(!straight.partial);
    let positions = straight.positions();
    assert_eq!(positions.len(), 3);
    assert!(approx(positions[0], start));
    assert!(approx(positions[1], Vec3::new(2.0, 0.0, 1.0)));
    assert!(approx(positions[2], end));
    assert_eq!(straight.points[2].poly, poly(&mesh, 4));

    // Budget of two points stops at the corner
    let short = query.find_straight_path(poly(&mesh, 0), &start, poly(&mesh, 4), &end, &filter, 2)?;
    assert!(short.partial);
    assert_eq!(short.len(), 2);
    Ok(())
}

#[test]
fn test_straight_path_between_positions() -> Result<()> {
    let mesh = l_shape_mesh()?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    let settings = NavQuerySettings::default();
    let filter = QueryFilter::default();

    let straight = query.find_straight_path_between(
        &Vec3::new(0.5, 1.0, 0.5),
        &Vec3::new(2.5, 1.0, 2.5),
        &settings,
        &filter,
    )?;
    assert_eq!(straight.len(), 3);
    assert!(query.has_path(
        &Vec3::new(0.5, 0.0, 0.5),
        &Vec3::new(2.5, 0.0, 2.5),
        &settings,
        &filter
    ));
    Ok(())
}

#[test]
fn test_disconnected_regions() -> Result<()> {
    let mesh = islands_mesh()?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(2.0, 0.0, 2.0);
    let end = Vec3::new(8.0, 0.0, 2.0);
    let r = query.find_path(poly(&mesh, 0), poly(&mesh, 1), &start, &end, &filter);
    assert!(matches!(r, Err(Error::NotFound(_))));
    assert!(!query.has_path_between(poly(&mesh, 0), poly(&mesh, 1), &start, &end, &filter));
    assert!(!query.has_path(&start, &end, &NavQuerySettings::default(), &filter));
    Ok(())
}

#[test]
fn test_partial_path_when_nodes_run_out() -> Result<()> {
    let mesh = single_tile_mesh(8)?;
    let mut query = NavMeshQuery::new(&mesh, 4)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(7.5, 0.0, 7.5);
    let path = query.find_path(poly(&mesh, 0), poly(&mesh, 63), &start, &end, &filter)?;
    assert!(path.partial);
    assert_eq!(path.polys.first(), Some(&poly(&mesh, 0)));
    assert_ne!(path.last(), Some(poly(&mesh, 63)));
    assert!(!query.has_path_between(poly(&mesh, 0), poly(&mesh, 63), &start, &end, &filter));

    let straight =
        query.find_straight_path(poly(&mesh, 0), &start, poly(&mesh, 63), &end, &filter, 32)?;
    assert!(straight.partial);
    Ok(())
}

#[test]
fn test_raycast_hits_wall() -> Result<()> {
    let mesh = islands_mesh()?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(1.0, 0.0, 2.0);
    let end = Vec3::new(8.0, 0.0, 2.0);
    let hit = query.raycast(poly(&mesh, 0), &start, &end, &filter, 16)?;
    assert!(hit.hit_wall());
    assert!((hit.t - 3.0 / 7.0).abs() < 1e-4);
    assert!(approx(hit.hit_position(start, end), Vec3::new(4.0, 0.0, 2.0)));
    assert!(approx(hit.hit_normal, Vec3::new(-1.0, 0.0, 0.0)));
    assert_eq!(hit.hit_edge_index, Some(2));
    assert_eq!(hit.path, vec![poly(&mesh, 0)]);
    Ok(())
}

#[test]
fn test_raycast_leaving_mesh_is_a_hit() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let start = Vec3::new(1.5, 0.0, 1.5);
    let end = Vec3::new(1.5, 0.0, 5.0);
    let hit = query.raycast(poly(&mesh, 4), &start, &end, &QueryFilter::default(), 16)?;
    assert!(hit.hit_wall());
    assert!((hit.hit_position(start, end).z - 3.0).abs() < 1e-3);
    assert_eq!(hit.path, vec![poly(&mesh, 4), poly(&mesh, 7)]);
    Ok(())
}

#[test]
fn test_raycast_unobstructed() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let start = Vec3::new(0.5, 0.0, 0.5);
    let end = Vec3::new(2.5, 0.0, 1.5);
    let hit = query.raycast(poly(&mesh, 0), &start, &end, &filter, 16)?;
    assert!(!hit.hit_wall());
    assert_eq!(hit.t, 1.0);
    assert_eq!(
        hit.path,
        vec![poly(&mesh, 0), poly(&mesh, 1), poly(&mesh, 4), poly(&mesh, 5)]
    );

    let capped = query.raycast(poly(&mesh, 0), &start, &end, &filter, 2)?;
    assert!(capped.partial);
    assert_eq!(capped.path_count(), 2);

    let between = query.raycast_between(&start, &end, &NavQuerySettings::default(), &filter)?;
    assert!(!between.hit_wall());
    Ok(())
}

#[test]
fn test_random_position() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let mut query = NavMeshQuery::new(&mesh, 128)?;
    query.set_random_seed(1234);
    let filter = QueryFilter::default();

    for _ in 0..32 {
        let (r, p) = query.get_random_position(&filter)?;
        assert!(mesh.is_valid_poly_ref(r));
        assert!((0.0..=3.0).contains(&p.x));
        assert!((0.0..=3.0).contains(&p.z));
        let (closest, _) = query.closest_point_on_poly(r, &p)?;
        assert!(closest.distance(p) < 1e-3);
    }

    let none = QueryFilter {
        include_flags: PolyFlags::SWIM,
        ..Default::default()
    };
    assert!(matches!(query.get_random_position(&none), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_move_along_surface() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    let (pos, visited) = query.move_along_surface(
        poly(&mesh, 0),
        &Vec3::new(0.5, 0.0, 0.5),
        &Vec3::new(2.5, 0.0, 0.5),
        &filter,
    )?;
    assert!(approx(pos, Vec3::new(2.5, 0.0, 0.5)));
    assert_eq!(visited, vec![poly(&mesh, 0), poly(&mesh, 1), poly(&mesh, 2)]);
    Ok(())
}

#[test]
fn test_move_along_surface_clamps_to_wall() -> Result<()> {
    let mesh = islands_mesh()?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let (pos, visited) = query.move_along_surface(
        poly(&mesh, 0),
        &Vec3::new(2.0, 0.0, 2.0),
        &Vec3::new(8.0, 0.0, 2.0),
        &QueryFilter::default(),
    )?;
    assert!(approx(pos, Vec3::new(4.0, 0.0, 2.0)));
    assert_eq!(visited, vec![poly(&mesh, 0)]);
    Ok(())
}

#[test]
fn test_local_neighbourhood() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let result = query.find_local_neighbourhood(
        poly(&mesh, 0),
        &Vec3::new(0.5, 0.0, 0.5),
        0.6,
        &QueryFilter::default(),
        16,
    )?;
    let mut refs: Vec<PolyRef> = result.iter().map(|(r, _)| *r).collect();
    refs.sort();
    assert_eq!(refs, vec![poly(&mesh, 0), poly(&mesh, 1), poly(&mesh, 3)]);
    assert_eq!(result[0], (poly(&mesh, 0), None));
    assert!(result[1..].iter().all(|(_, parent)| *parent == Some(poly(&mesh, 0))));
    Ok(())
}

#[test]
fn test_poly_wall_segments() -> Result<()> {
    let mesh = single_tile_mesh(3)?;
    let query = NavMeshQuery::new(&mesh, 128)?;
    let filter = QueryFilter::default();

    assert_eq!(query.poly_wall_segments(poly(&mesh, 0), &filter)?.len(), 2);
    assert!(query.poly_wall_segments(poly(&mesh, 4), &filter)?.is_empty());

    // Neighbours that fail the filter become walls
    let walk_only = QueryFilter {
        exclude_flags: PolyFlags::WALK,
        ..Default::default()
    };
    assert_eq!(query.poly_wall_segments(poly(&mesh, 4), &walk_only)?.len(), 4);
    Ok(())
}

#[test]
fn test_stale_refs_after_remove() -> Result<()> {
    let mut mesh = single_tile_mesh(2)?;
    let old = poly(&mesh, 0);
    assert!(mesh.remove_tile(0, 0));

    let mut query = NavMeshQuery::new(&mesh, 64)?;
    let p = Vec3::new(0.5, 0.0, 0.5);
    let filter = QueryFilter::default();
    assert!(query.find_path(old, old, &p, &p, &filter).is_err());
    assert!(query.raycast(old, &p, &Vec3::new(1.5, 0.0, 0.5), &filter, 8).is_err());
    assert!(query.poly_wall_segments(old, &filter).is_err());
    assert!(query.find_nearest_poly(&p, &Vec3::ONE, &filter).is_err());
    Ok(())
}
