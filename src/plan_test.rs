use crate::plan::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

fn sources_fixture() -> BTreeMap<u32, Vec<String>> {
    BTreeMap::from([
        (1, vec!["Base".to_string(), "DonorA".to_string()]),
        (2, vec!["Base".to_string()]),
        (3, vec!["DonorA".to_string()]),
    ])
}

#[test]
fn test_plan_overrides_implicit_and_unused_donors() {
    let selected: BTreeSet<u32> = [1, 2, 3].into_iter().collect();
    let needed: BTreeSet<String> = ["DonorA".to_string(), "DonorB".to_string()].into_iter().collect();
    let preferred = BTreeMap::from([(1, "DonorA".to_string())]);
    let sources = sources_fixture();
    let donor_order = vec!["DonorA".to_string()];

    let (text, log_lines, plan) =
        format_preflight_summary(Path::new("OUT"), &selected, &needed, &preferred, Some(&sources), &donor_order);

    assert_eq!(plan.selected_song_count, 3);
    assert!(plan.override_counts["DonorA"] >= 1);
    assert!(plan.implicit_counts["DonorA"] >= 1);
    assert_eq!(plan.unused_needed_donors, vec!["DonorB".to_string()]);
    assert!(plan.missing_in_all_sources.is_empty());
    assert!(plan.mismatched_preferred_source.is_empty());
    assert_eq!(plan.planned_counts["Base"], 1);
    assert_eq!(plan.planned_counts["DonorA"], 2);
    assert_eq!(plan.songs_with_duplicates, 1);

    assert!(text.contains("Preflight summary"));
    assert!(text.contains("Included songs: 3"));
    assert!(text.contains("Unused donors (no songs routed): DonorB"));
    assert!(log_lines.iter().any(|l| l.starts_with("Build plan: 3 songs")));
}

#[test]
fn test_plan_flags_mismatched_preferred_source() {
    let selected: BTreeSet<u32> = [1].into_iter().collect();
    let preferred = BTreeMap::from([(1, "DonorX".to_string())]);
    let sources = sources_fixture();

    let (_text, log_lines, plan) = format_preflight_summary(
        Path::new("OUT"),
        &selected,
        &BTreeSet::new(),
        &preferred,
        Some(&sources),
        &[],
    );
    assert_eq!(plan.mismatched_preferred_source, vec![1]);
    assert_eq!(plan.planned_counts.get("DonorX"), Some(&1));
    assert!(log_lines.iter().any(|l| l.contains("preferred source missing song")));
}

#[test]
fn test_plan_routes_unclaimed_songs_to_base() {
    // 42 is absent from the ownership map and 43 maps to an empty source
    // list; both route to Base, same as when no ownership info is supplied.
    let selected: BTreeSet<u32> = [42, 43].into_iter().collect();
    let mut sources = sources_fixture();
    sources.insert(43, Vec::new());

    let (text, _log, plan) = format_preflight_summary(
        Path::new("OUT"),
        &selected,
        &BTreeSet::new(),
        &BTreeMap::new(),
        Some(&sources),
        &[],
    );
    assert_eq!(plan.planned_counts["Base"], 2);
    assert!(plan.missing_in_all_sources.is_empty());
    assert!(!text.contains("Potential issues"));
}

#[test]
fn test_plan_without_ownership_info_routes_everything_to_base() {
    let selected: BTreeSet<u32> = [1, 2].into_iter().collect();
    let (_text, _log, plan) = format_preflight_summary(
        Path::new("OUT"),
        &selected,
        &BTreeSet::new(),
        &BTreeMap::new(),
        None,
        &[],
    );
    assert_eq!(plan.planned_counts["Base"], 2);
    assert!(plan.missing_in_all_sources.is_empty());
}

#[test]
fn test_planned_winner_follows_donor_order() {
    let sources = BTreeMap::from([(7, vec!["DonorB".to_string(), "DonorA".to_string()])]);
    let order = vec!["DonorA".to_string(), "DonorB".to_string()];
    let w = BuildPlan::planned_winner(7, &BTreeMap::new(), Some(&sources), &order);
    assert_eq!(w, "DonorA");

    // Explicit preference wins over everything.
    let preferred = BTreeMap::from([(7, "DonorB".to_string())]);
    let w = BuildPlan::planned_winner(7, &preferred, Some(&sources), &order);
    assert_eq!(w, "DonorB");

    // A song the ownership map does not know still defaults to Base.
    assert_eq!(BuildPlan::planned_winner(99, &BTreeMap::new(), Some(&sources), &order), "Base");
}

#[test]
fn test_dedupe_stats_histogram_and_winners() {
    let selected: BTreeSet<u32> = [1, 2, 3].into_iter().collect();
    let winners = BTreeMap::from([
        (1, "Base".to_string()),
        (2, "DonorA".to_string()),
        (3, "DonorA".to_string()),
    ]);
    let stats = compute_dedupe_stats(&selected, &winners, None);
    assert_eq!(stats.selected_unique, 3);
    assert_eq!(stats.winner_counts["DonorA"], 2);
    assert_eq!(stats.songs_with_duplicates, 0);

    let sources = BTreeMap::from([
        (1, vec!["Base".to_string()]),
        (2, vec!["Base".to_string(), "DonorA".to_string()]),
        (3, vec!["Base".to_string(), "DonorA".to_string(), "DonorB".to_string()]),
    ]);
    let stats2 = compute_dedupe_stats(&selected, &winners, Some(&sources));
    assert_eq!(stats2.songs_with_duplicates, 2);
    assert_eq!(stats2.extra_occurrences_hidden, 3);
    assert_eq!(stats2.dup_count_histogram["1"], 1);
    assert_eq!(stats2.dup_count_histogram["2"], 1);
    assert_eq!(stats2.dup_count_histogram["3"], 1);
}
