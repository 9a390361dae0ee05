//! Property-based testing for xfer
//!
//! Uses proptest to check the line encoding, tag derivation and manifest
//! comparison against randomly generated inputs.

use ::xfer::entry::camel_to_upper_snake;
use ::xfer::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Generate random relative file paths
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let dir_strategy = prop::collection::vec(
        prop_oneof!["[a-z]{1,10}", "dir[0-9]{1,3}", "[a-zA-Z0-9 _.-]{1,12}"],
        0..=3,
    );
    let filename_strategy = prop_oneof![
        "[a-z]{1,10}\\.(txt|rs|bin)",
        "[a-zA-Z0-9_-]{1,20}",
        "#[a-z]{1,8}",
        "[\\PC&&[^/\\\\\\x00]]{1,16}",
    ];

    (dir_strategy, filename_strategy).prop_map(|(dirs, name)| {
        let mut path = PathBuf::new();
        for dir in dirs.into_iter().filter(|d| d != "." && d != "..") {
            path.push(dir);
        }
        path.push(name);
        path
    })
}

fn digest_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{128}"
}

fn metadata_strategy() -> impl Strategy<Value = Metadata> {
    (path_strategy(), 0u64..1 << 40, digest_strategy())
        .prop_map(|(name, size, digest)| Metadata { name, size, digest })
}

/// A manifest with unique names
fn manifest_strategy() -> impl Strategy<Value = Vec<Metadata>> {
    prop::collection::vec(metadata_strategy(), 0..40).prop_map(|entries| {
        let unique: BTreeMap<PathBuf, Metadata> =
            entries.into_iter().map(|m| (m.name.clone(), m)).collect();
        unique.into_values().collect()
    })
}

fn entry_strategy() -> impl Strategy<Value = Entry> {
    let timestamp = 0.0f64..4_000_000_000.0;
    prop_oneof![
        (path_strategy(), any::<u64>()).prop_map(|(name, size)| Entry::from(FileInfo { name, size })),
        metadata_strategy().prop_map(Entry::from),
        (path_strategy(), any::<u64>())
            .prop_map(|(name, size)| Entry::from(TransferRequest { name, size })),
        (path_strategy(), any::<u64>())
            .prop_map(|(name, size)| Entry::from(VerifyRequest { name, size })),
        (path_strategy(), any::<u64>(), digest_strategy(), timestamp.clone()).prop_map(
            |(name, size, digest, timestamp)| {
                Entry::from(TransferComplete {
                    name,
                    size,
                    digest,
                    timestamp,
                })
            }
        ),
        timestamp.prop_map(|timestamp| Entry::from(SyncDone { timestamp })),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_entry_line_round_trip(entry in entry_strategy()) {
        let line = entry.encode().unwrap();
        prop_assert!(!line.contains('\n'));
        prop_assert!(line.starts_with(entry.tag()));

        let decoded = Entry::decode(&line).unwrap();
        prop_assert_eq!(decoded, entry);
    }

    #[test]
    fn prop_manifest_file_round_trip(entries in prop::collection::vec(entry_strategy(), 0..30)) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("manifest.log");

        let writer = ManifestWriter::create(&path).unwrap();
        for entry in &entries {
            writer.write_comment("interleaved comment").unwrap();
            writer.write_entry(entry).unwrap();
        }

        let read: Vec<Entry> = read_manifest(&path)
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        prop_assert_eq!(read, entries);
    }

    #[test]
    fn prop_tags_are_upper_snake(name in "[A-Z][a-zA-Z]{0,20}") {
        let tag = camel_to_upper_snake(&name);
        prop_assert!(tag.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        prop_assert!(!tag.starts_with('_'));
        prop_assert!(!tag.ends_with('_'));
        prop_assert!(!tag.contains("__"));
        prop_assert_eq!(tag.replace('_', ""), name.to_uppercase());
    }

    #[test]
    fn prop_diff_sets_partition_paths(left in manifest_strategy(), right in manifest_strategy()) {
        let result = diff::diff_manifests(&left, &right);

        prop_assert!(result.only_in_source.is_disjoint(&result.only_in_dest));
        prop_assert!(result.only_in_source.is_disjoint(&result.differing));
        prop_assert!(result.only_in_dest.is_disjoint(&result.differing));

        for m in &left {
            let in_right = right.iter().find(|r| r.name == m.name);
            match in_right {
                None => prop_assert!(result.only_in_source.contains(&m.name)),
                Some(r) if r == m => {
                    prop_assert!(!result.differing.contains(&m.name));
                }
                Some(_) => prop_assert!(result.differing.contains(&m.name)),
            }
        }
        for m in &right {
            if !left.iter().any(|l| l.name == m.name) {
                prop_assert!(result.only_in_dest.contains(&m.name));
            }
        }
    }

    #[test]
    fn prop_diff_is_idempotent_and_symmetric(left in manifest_strategy(), right in manifest_strategy()) {
        let forward = diff::diff_manifests(&left, &right);
        prop_assert_eq!(&forward, &diff::diff_manifests(&left, &right));

        let backward = diff::diff_manifests(&right, &left);
        prop_assert_eq!(&forward.only_in_source, &backward.only_in_dest);
        prop_assert_eq!(&forward.only_in_dest, &backward.only_in_source);
        prop_assert_eq!(&forward.differing, &backward.differing);

        let mut shuffled = left.clone();
        shuffled.reverse();
        prop_assert_eq!(&forward, &diff::diff_manifests(&shuffled, &right));
    }

    #[test]
    fn prop_plan_totals_match_items(left in manifest_strategy(), right in manifest_strategy()) {
        let source = Snapshot {
            version: snapshot::SNAPSHOT_VERSION.to_string(),
            root: PathBuf::from("/source"),
            algorithm: DigestAlgorithm::Sha512,
            manifest: left,
        };
        let result = diff::diff_manifests(&source.manifest, &right);

        let plan = result.plan(&source, MismatchPolicy::VerifyThenTransfer);
        prop_assert_eq!(plan.items.len() as u64, plan.totals.planned_files());
        prop_assert_eq!(plan.totals.files_to_transfer as usize, result.only_in_source.len());
        prop_assert_eq!(plan.totals.files_to_verify as usize, result.differing.len());
        prop_assert_eq!(plan.totals.files_at_source as usize, source.manifest.len());

        let names: Vec<&PathBuf> = plan.items.iter().map(|i| &i.source.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        prop_assert_eq!(names, sorted);
    }
}
