//! End-to-end planning tests: catalog on disk → plan → store.

use mapterhorn_dem::{write_geotiff, TileCoord};
use mapterhorn_plan::{build_plan, BlendConfig, Kernel, PlanOptions, PlanStore, Registry};
use std::fs;

const ZOOM: u8 = 9;

/// Mercator extent of tiles x0..=x1 in row y at ZOOM.
fn span(x0: u32, x1: u32, y: u32) -> [f64; 4] {
    let a = TileCoord::new(ZOOM, x0, y).mercator_bounds();
    let b = TileCoord::new(ZOOM, x1, y).mercator_bounds();
    [a.min_x, a.min_y, b.max_x, b.max_y]
}

fn catalog(a: [f64; 4], b: [f64; 4]) -> String {
    format!(
        r#"
sources:
  - id: a
    resolution: 10
    files:
      - path: a.tif
        bounds: [{}, {}, {}, {}]
  - id: b
    resolution: 1
    files:
      - path: b.tif
        bounds: [{}, {}, {}, {}]
"#,
        a[0], a[1], a[2], a[3], b[0], b[1], b[2], b[3]
    )
}

fn options() -> PlanOptions {
    PlanOptions {
        min_zoom: 5,
        max_zoom: ZOOM,
        tile_size: 64,
        buffer_px: 4,
        blend: BlendConfig {
            falloff_px: 4.0,
            kernel: Kernel::Smoothstep,
        },
    }
}

#[test]
fn test_two_source_scenario_plan() {
    // A covers X1..X10, B covers X5..X7 only
    let dir = tempfile::tempdir().unwrap();
    let text = catalog(span(300, 309, 200), span(304, 306, 200));
    let registry = Registry::from_yaml_str(&text, dir.path()).unwrap();
    let plan = build_plan(&registry, &options()).unwrap();

    assert_eq!(plan.len(), 10);
    for item in &plan.items {
        let ids: Vec<&str> = item
            .contributors
            .iter()
            .map(|c| c.source_id.as_str())
            .collect();
        if (304..=306).contains(&item.tile.x) {
            assert_eq!(ids, vec!["b", "a"], "tile {}", item.tile);
        } else {
            assert_eq!(ids, vec!["a"], "tile {}", item.tile);
        }
    }
}

#[test]
fn test_completeness() {
    let dir = tempfile::tempdir().unwrap();
    let text = catalog(span(100, 103, 80), span(102, 110, 80));
    let registry = Registry::from_yaml_str(&text, dir.path()).unwrap();
    let plan = build_plan(&registry, &options()).unwrap();

    for source in registry.sources() {
        let coverage = mapterhorn_plan::Coverage::from_source(source).unwrap();
        for (tile, _) in coverage.tiles_at(ZOOM) {
            let item = plan.item(tile).expect("tile planned");
            assert!(item.contributors.iter().any(|c| c.source_id == source.id));
        }
    }
    // Every tile exactly once
    let mut tiles: Vec<_> = plan.tiles().collect();
    let before = tiles.len();
    tiles.dedup();
    assert_eq!(tiles.len(), before);
}

#[test]
fn test_bounds_read_from_geotiff() {
    let dir = tempfile::tempdir().unwrap();
    let b = TileCoord::new(ZOOM, 12, 40).mercator_bounds();
    write_geotiff(dir.path().join("only.tif"), &[1.0; 16], 4, 4, b, None).unwrap();
    fs::write(
        dir.path().join("catalog.yaml"),
        "sources:\n  - id: only\n    resolution: 5\n    files:\n      - path: only.tif\n",
    )
    .unwrap();

    let registry = Registry::from_yaml_file(dir.path().join("catalog.yaml")).unwrap();
    let plan = build_plan(&registry, &options()).unwrap();
    assert_eq!(plan.tiles().collect::<Vec<_>>(), vec![TileCoord::new(ZOOM, 12, 40)]);
}

#[test]
fn test_store_and_diff_versions() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlanStore::open(dir.path().join("plans")).unwrap();

    let r1 = Registry::from_yaml_str(&catalog(span(10, 14, 7), span(11, 11, 7)), dir.path()).unwrap();
    let r2 = Registry::from_yaml_str(&catalog(span(10, 15, 7), span(12, 12, 7)), dir.path()).unwrap();
    let p1 = build_plan(&r1, &options()).unwrap();
    let p2 = build_plan(&r2, &options()).unwrap();
    let v1 = store.save(&p1).unwrap();
    let v2 = store.save(&p2).unwrap();
    assert!(v2 > v1);

    let loaded1 = store.load(v1).unwrap();
    let loaded2 = store.load(v2).unwrap();
    let diff = loaded2.diff(&loaded1);
    assert_eq!(diff.added, vec![TileCoord::new(ZOOM, 15, 7)]);
    assert!(diff.removed.is_empty());
    // B moved from x=11 to x=12; neighbours within the buffer also change files
    assert!(diff.changed.contains(&TileCoord::new(ZOOM, 11, 7)));
    assert!(diff.changed.contains(&TileCoord::new(ZOOM, 12, 7)));

    // Re-planning the same registry reproduces the stored bytes
    let again = build_plan(&r1, &options()).unwrap();
    assert_eq!(again.digest().unwrap(), store.record(v1).unwrap().digest);
}
