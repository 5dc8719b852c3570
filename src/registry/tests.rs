// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::Write;

use hifitime::{Duration, Unit};
use tempfile::TempDir;
use vec1::vec1;

use super::*;
use crate::time::parse_utc;

fn registry() -> (TempDir, Registry) {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    (tmp, Registry::new(store))
}

/// Write a CASA-style table: a directory with something in it.
fn make_table(tmp: &TempDir, name: &str) -> PathBuf {
    let dir = tmp.path().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut f = File::create(dir.join("table.dat")).unwrap();
    f.write_all(b"solutions").unwrap();
    dir
}

fn full_set(tmp: &TempDir, prefix: &str) -> Vec1<CalTable> {
    vec1![
        CalTable {
            kind: CalTableKind::GP,
            path: make_table(tmp, &format!("{prefix}_gpcal")),
        },
        CalTable {
            kind: CalTableKind::K,
            path: make_table(tmp, &format!("{prefix}_kcal")),
        },
        CalTable {
            kind: CalTableKind::BP,
            path: make_table(tmp, &format!("{prefix}_bpcal")),
        },
    ]
}

#[test]
fn register_orders_tables_by_kind() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-03T00:00:00").unwrap();

    // Declared GP, K, BP; the registry must order K < BP < GP.
    let paths = registry
        .register_set("cal_3C48", full_set(&tmp, "a"), start, end)
        .unwrap();
    assert_eq!(paths.len(), 3);
    assert!(paths[0].ends_with("a_kcal"));
    assert!(paths[1].ends_with("a_bpcal"));
    assert!(paths[2].ends_with("a_gpcal"));

    let mid = parse_utc("2025-10-02T12:00:00").unwrap();
    let (name, tables) = registry.lookup(mid).unwrap();
    assert_eq!(name, "cal_3C48");
    assert_eq!(
        tables.iter().map(|t| t.kind.as_str()).collect::<Vec<_>>(),
        ["K", "BP", "GP"]
    );
}

#[test]
fn verification_failure_rolls_back_the_whole_set() {
    // spec scenario: 3 tables, the 2nd fails the existence check; the result
    // is 0 active tables and a reported failure.
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-03T00:00:00").unwrap();

    let tables = full_set(&tmp, "b");
    // Remove the bandpass table from disk after declaring it.
    std::fs::remove_dir_all(tmp.path().join("b_bpcal")).unwrap();

    let result = registry.register_set("cal_bad", tables, start, end);
    assert!(matches!(
        result,
        Err(RegistryError::VerificationFailed { .. })
    ));

    // Rollback is total: no subset of the set stayed active.
    let sets = registry.list_sets().unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].n_active, 0);
    let mid = parse_utc("2025-10-02T12:00:00").unwrap();
    assert!(matches!(
        registry.lookup(mid),
        Err(RegistryError::NoApplicableSet { .. })
    ));
}

#[test]
fn empty_table_fails_verification() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-03T00:00:00").unwrap();

    // An empty directory is a half-written table, not a table.
    let empty = tmp.path().join("c_kcal");
    std::fs::create_dir_all(&empty).unwrap();
    let result = registry.register_set(
        "cal_empty",
        vec1![CalTable {
            kind: CalTableKind::K,
            path: empty,
        }],
        start,
        end,
    );
    assert!(matches!(
        result,
        Err(RegistryError::VerificationFailed { .. })
    ));
}

#[test]
fn lookup_respects_window_bounds_and_reports_no_match() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-02T06:00:00").unwrap();
    registry
        .register_set("cal_narrow", full_set(&tmp, "d"), start, end)
        .unwrap();

    // Start is inclusive, end exclusive.
    assert!(registry.lookup(start).is_ok());
    assert!(matches!(
        registry.lookup(end),
        Err(RegistryError::NoApplicableSet { .. })
    ));
    assert!(matches!(
        registry.lookup(start - Duration::from_f64(1.0, Unit::Second)),
        Err(RegistryError::NoApplicableSet { .. })
    ));
}

#[test]
fn newest_set_wins_overlapping_windows() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-03T00:00:00").unwrap();

    registry
        .register_set("cal_first", full_set(&tmp, "e"), start, end)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    registry
        .register_set("cal_second", full_set(&tmp, "f"), start, end)
        .unwrap();

    let mid = parse_utc("2025-10-02T12:00:00").unwrap();
    let (name, _) = registry.lookup(mid).unwrap();
    assert_eq!(name, "cal_second");

    // Retiring the winner exposes the earlier set deterministically.
    registry.retire_set("cal_second").unwrap();
    let (name, _) = registry.lookup(mid).unwrap();
    assert_eq!(name, "cal_first");
}

#[test]
fn narrow_and_wide_windows_are_both_honoured() {
    // The validity width is policy, not registry logic: a window as short as
    // one observation and one spanning days must behave identically.
    let (tmp, registry) = registry();
    let obs_mid = parse_utc("2025-10-02T01:05:00").unwrap();

    let half_narrow = Duration::from_f64(2.5, Unit::Minute);
    registry
        .register_set(
            "cal_narrow",
            full_set(&tmp, "g"),
            obs_mid - half_narrow,
            obs_mid + half_narrow,
        )
        .unwrap();
    // In the narrow window.
    assert_eq!(registry.lookup(obs_mid).unwrap().0, "cal_narrow");
    // An hour later is outside it.
    let later = obs_mid + Duration::from_f64(1.0, Unit::Hour);
    assert!(registry.lookup(later).is_err());

    let half_wide = Duration::from_f64(24.0, Unit::Hour);
    std::thread::sleep(std::time::Duration::from_millis(5));
    registry
        .register_set(
            "cal_wide",
            full_set(&tmp, "h"),
            obs_mid - half_wide,
            obs_mid + half_wide,
        )
        .unwrap();
    assert_eq!(registry.lookup(later).unwrap().0, "cal_wide");
}

#[test]
fn duplicate_kinds_and_paths_are_rejected_before_writing() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let end = parse_utc("2025-10-03T00:00:00").unwrap();

    let k1 = make_table(&tmp, "i_kcal");
    let k2 = make_table(&tmp, "i2_kcal");
    let result = registry.register_set(
        "cal_dup",
        vec1![
            CalTable { kind: CalTableKind::K, path: k1.clone() },
            CalTable { kind: CalTableKind::K, path: k2 },
        ],
        start,
        end,
    );
    assert!(matches!(result, Err(RegistryError::DuplicateKind { .. })));

    let result = registry.register_set(
        "cal_dup",
        vec1![
            CalTable { kind: CalTableKind::K, path: k1.clone() },
            CalTable { kind: CalTableKind::BP, path: k1 },
        ],
        start,
        end,
    );
    assert!(matches!(result, Err(RegistryError::DuplicatePath { .. })));
    // Nothing was written.
    assert!(registry.list_sets().unwrap().is_empty());
}

#[test]
fn inverted_window_is_rejected() {
    let (tmp, registry) = registry();
    let start = parse_utc("2025-10-02T00:00:00").unwrap();
    let result = registry.register_set("cal_bad", full_set(&tmp, "j"), start, start);
    assert!(matches!(result, Err(RegistryError::InvalidWindow { .. })));
}

#[test]
fn retire_unknown_set_is_an_error() {
    let (_tmp, registry) = registry();
    assert!(matches!(
        registry.retire_set("no_such_set"),
        Err(RegistryError::UnknownSet(_))
    ));
}
