// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end pipeline tests against stub collaborator tools.
//!
//! Subband files are dropped into a watched directory, assembled into
//! groups, and driven through convert, calibrate and image, where each
//! external tool is a small shell script. A calibrator group must solve and
//! register tables that a later science group then discovers and applies.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use contimg::assembler::Assembler;
use contimg::orchestrator::Orchestrator;
use contimg::registry::Registry;
use contimg::retry::BackoffPolicy;
use contimg::stages::production_graph;
use contimg::{GroupState, Settings, Store};

/// Write the pipeline config pointing all paths into `root`. The stub tools
/// leave a visible product per stage so the test can check them.
fn write_config(root: &Path, flaky_imager: bool) -> PathBuf {
    let image_script = if flaky_imager {
        // Fails the first invocation per group, succeeds afterwards.
        "if test ! -f {output_dir}/{group_key}.imaged_once; then \
         touch {output_dir}/{group_key}.imaged_once; exit 1; fi; \
         echo image > {output_dir}/{group_key}.fits"
    } else {
        "echo image > {output_dir}/{group_key}.fits"
    };
    // Written without format!: the tool templates are full of literal braces.
    let config = r#"
[paths]
input_dir = "ROOT/incoming"
output_dir = "ROOT/products"
scratch_dir = "ROOT/scratch"
state_db = "ROOT/state/contimg.sqlite3"

[ingest]
expected_subbands = 2
window_minutes = 5.0
poll_interval_s = 0.1

[retry]
max_retries = 3
initial_delay_s = 0.0
max_delay_s = 0.0

[orchestrator]
workers = 1
stale_after_s = 3600.0
idle_wait_s = 0.1

[cal]
validity_width_hours = 24.0

[[calibrators]]
name = "3C48"
start = "2025-10-02T01:00:00"
end = "2025-10-02T01:10:00"

[tools.convert]
program = "/bin/sh"
args = ["-c", "echo vis > {output_dir}/{group_key}.ms"]
outputs = [{ name = "vis_set", path = "{output_dir}/{group_key}.ms" }]

[tools.calibrate_solve]
program = "/bin/sh"
args = ["-c", "mkdir -p {output_dir}/{group_key}_kcal {output_dir}/{group_key}_bpcal && echo k > {output_dir}/{group_key}_kcal/t.dat && echo bp > {output_dir}/{group_key}_bpcal/t.dat"]
outputs = [
    { name = "K", path = "{output_dir}/{group_key}_kcal" },
    { name = "BP", path = "{output_dir}/{group_key}_bpcal" },
]

[tools.calibrate_apply]
program = "/bin/sh"
args = ["-c", "echo calibrated > {output_dir}/{group_key}_cal.ms"]
outputs = [{ name = "vis_cal", path = "{output_dir}/{group_key}_cal.ms" }]

[tools.image]
program = "/bin/sh"
args = ["-c", "IMAGE_SCRIPT"]
outputs = [{ name = "image", path = "{output_dir}/{group_key}.fits" }]
"#
    .replace("ROOT", &root.display().to_string())
    .replace("IMAGE_SCRIPT", image_script);
    for dir in ["incoming", "products", "scratch", "state"] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
    }
    let path = root.join("contimg.toml");
    std::fs::write(&path, config).unwrap();
    path
}

fn write_subband(root: &Path, timestamp: &str, idx: usize) {
    let path = root
        .join("incoming")
        .join(format!("{timestamp}_sb{idx:02}.hdf5"));
    let mut f = File::create(path).unwrap();
    f.write_all(b"payload").unwrap();
}

struct Pipeline {
    store: Arc<Store>,
    assembler: Assembler,
    orchestrator: Orchestrator,
    settings: Settings,
}

fn build(root: &Path, flaky_imager: bool) -> Pipeline {
    let config = write_config(root, flaky_imager);
    let settings = Settings::load(&config).unwrap();
    let store = Arc::new(Store::open(&settings.paths.state_db).unwrap());
    let registry = Registry::new(Arc::clone(&store));
    let graph = production_graph(Arc::clone(&store), registry, &settings).unwrap();
    let assembler = Assembler::new(Arc::clone(&store), &settings).unwrap();
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        graph,
        BackoffPolicy::new(&settings.retry),
    );
    Pipeline {
        store,
        assembler,
        orchestrator,
        settings,
    }
}

/// Process until nothing can make further progress.
fn drain(p: &Pipeline) {
    loop {
        while p.orchestrator.process_next().unwrap().is_some() {}
        let report = p.orchestrator.sweep(3600.0).unwrap();
        if report.requeued > 0 {
            continue;
        }
        let live: usize = p
            .store
            .counts_by_state()
            .unwrap()
            .into_iter()
            .filter(|(state, _)| {
                matches!(state, GroupState::Pending | GroupState::InProgress)
            })
            .map(|(_, n)| n)
            .sum();
        if live == 0 {
            return;
        }
    }
}

#[test]
fn calibrator_then_science_group_complete_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let p = build(tmp.path(), false);

    // A calibrator group in the 01:00 window, then a science group at 02:00.
    write_subband(tmp.path(), "2025-10-02T01:02:00", 0);
    write_subband(tmp.path(), "2025-10-02T01:03:00", 1);
    write_subband(tmp.path(), "2025-10-02T02:01:00", 0);
    write_subband(tmp.path(), "2025-10-02T02:02:00", 1);

    let stats = p
        .assembler
        .scan_directory(&p.settings.paths.input_dir)
        .unwrap();
    assert_eq!(stats.recorded, 4);
    assert_eq!(stats.completed_groups, 2);

    drain(&p);

    for key in ["2025-10-02T01:00:00", "2025-10-02T02:00:00"] {
        let group = p.store.group(key).unwrap().unwrap();
        assert_eq!(group.state, GroupState::Completed, "group {key}");
        assert_eq!(group.retry_count, 0);
        // Every stage left a timing entry.
        let sample = p.store.perf_sample(key).unwrap().unwrap();
        let names: Vec<&str> = sample
            .stage_seconds
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, ["convert", "calibrate", "image"]);
    }

    let products = tmp.path().join("products");
    // The calibrator group solved tables; the science group applied them.
    assert!(products.join("2025-10-02T01:00:00_kcal").is_dir());
    assert!(products.join("2025-10-02T02:00:00_cal.ms").is_file());
    assert!(products.join("2025-10-02T01:00:00.fits").is_file());
    assert!(products.join("2025-10-02T02:00:00.fits").is_file());

    // The solved set is in the registry, valid around both groups.
    let registry = Registry::new(Arc::clone(&p.store));
    let sets = registry.list_sets().unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].set_name, "cal_2025-10-02T01:00:00");
    assert_eq!(sets[0].n_active, 2);

    // Scratch space was fully released.
    assert!(std::fs::read_dir(tmp.path().join("scratch"))
        .unwrap()
        .next()
        .is_none());
}

#[test]
fn science_group_without_calibration_fails_after_budget() {
    let tmp = TempDir::new().unwrap();
    let p = build(tmp.path(), false);

    // No calibrator group ever shows up: the science group can't calibrate.
    write_subband(tmp.path(), "2025-10-02T02:01:00", 0);
    write_subband(tmp.path(), "2025-10-02T02:02:00", 1);
    p.assembler
        .scan_directory(&p.settings.paths.input_dir)
        .unwrap();

    drain(&p);

    let group = p.store.group("2025-10-02T02:00:00").unwrap().unwrap();
    assert_eq!(group.state, GroupState::Failed);
    // Exhausted exactly at the configured budget; the error names the
    // distinguishable "no calibration" condition.
    assert_eq!(group.retry_count, 3);
    assert!(!group.terminal);
    assert!(group.error.unwrap().contains("no calibration available"));
}

#[test]
fn transient_imaging_failures_are_retried_to_success() {
    let tmp = TempDir::new().unwrap();
    let p = build(tmp.path(), true);

    // A calibrator group only, with an imager that fails its first attempt.
    write_subband(tmp.path(), "2025-10-02T01:02:00", 0);
    write_subband(tmp.path(), "2025-10-02T01:03:00", 1);
    p.assembler
        .scan_directory(&p.settings.paths.input_dir)
        .unwrap();

    drain(&p);

    let group = p.store.group("2025-10-02T01:00:00").unwrap().unwrap();
    assert_eq!(group.state, GroupState::Completed);
    assert_eq!(group.retry_count, 1);
    assert!(tmp
        .path()
        .join("products")
        .join("2025-10-02T01:00:00.fits")
        .is_file());
}
