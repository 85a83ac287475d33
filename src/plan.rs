/// Preflight plan computation: per-song winner planning, override/implicit
/// accounting, and the summary text written next to the output disc.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Local;
use serde::Serialize;

use crate::catalog::BASE_LABEL;

/// Structured build plan derived from the selection, preferences, and donor
/// ordering. Embedded verbatim in the build report JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildPlan {
    pub selected_song_count: u64,
    pub planned_counts: BTreeMap<String, u64>,
    pub override_counts: BTreeMap<String, u64>,
    pub implicit_counts: BTreeMap<String, u64>,
    pub songs_with_duplicates: u64,
    pub needed_donors: Vec<String>,
    pub donor_order: Vec<String>,
    pub unused_needed_donors: Vec<String>,
    /// Unclaimed songs route to Base, so the planner leaves this empty.
    pub missing_in_all_sources: Vec<u32>,
    pub mismatched_preferred_source: Vec<u32>,
}

impl BuildPlan {
    /// Winner label for a selected song. Mirrors the planning pass so callers
    /// can ask per-song questions. A song no source claims routes to Base,
    /// whether ownership info is absent, the id is unknown, or its source
    /// list is empty.
    pub fn planned_winner(
        sid: u32,
        preferred: &BTreeMap<u32, String>,
        sources: Option<&BTreeMap<u32, Vec<String>>>,
        donor_order: &[String],
    ) -> String {
        let srcs = uniq_keep_order(sources.and_then(|m| m.get(&sid)).map(|v| v.as_slice()).unwrap_or(&[]));
        if let Some(explicit) = preferred.get(&sid) {
            return explicit.clone();
        }
        if srcs.is_empty() || srcs.iter().any(|s| s == BASE_LABEL) {
            return BASE_LABEL.to_string();
        }
        for lab in donor_order {
            if srcs.iter().any(|s| s == lab) {
                return lab.clone();
            }
        }
        srcs.iter()
            .find(|s| *s != BASE_LABEL)
            .cloned()
            .unwrap_or_else(|| BASE_LABEL.to_string())
    }
}

fn uniq_keep_order(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for it in items {
        if !it.is_empty() && !out.contains(it) {
            out.push(it.clone());
        }
    }
    out
}

/// Compute the plan and render the preflight summary.
///
/// Returns `(full_text_for_file, key_lines_for_log, plan)`.
pub fn format_preflight_summary(
    out_dir: &Path,
    selected_song_ids: &BTreeSet<u32>,
    needed_donors: &BTreeSet<String>,
    preferred_source_by_song_id: &BTreeMap<u32, String>,
    song_sources_by_id: Option<&BTreeMap<u32, Vec<String>>>,
    donor_order: &[String],
) -> (String, Vec<String>, BuildPlan) {
    let donors: Vec<String> = donor_order.iter().filter(|s| !s.is_empty()).cloned().collect();
    let needed: BTreeSet<String> = needed_donors.iter().filter(|s| !s.is_empty()).cloned().collect();

    let mut planned_counts: BTreeMap<String, u64> = BTreeMap::from([(BASE_LABEL.to_string(), 0)]);
    let mut override_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut implicit_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut mismatched_prefs: Vec<u32> = Vec::new();
    let mut songs_with_dups = 0u64;

    for &sid in selected_song_ids {
        let srcs = uniq_keep_order(
            song_sources_by_id.and_then(|m| m.get(&sid)).map(|v| v.as_slice()).unwrap_or(&[]),
        );
        if srcs.len() > 1 {
            songs_with_dups += 1;
        }

        let explicit = preferred_source_by_song_id.get(&sid);
        let mut is_implicit = false;
        let planned: String = match explicit {
            Some(pref) => {
                if !srcs.is_empty() && !srcs.iter().any(|s| s == pref) {
                    mismatched_prefs.push(sid);
                }
                pref.clone()
            }
            None => {
                // Songs no source claims fall through to the base.
                if srcs.is_empty() || srcs.iter().any(|s| s == BASE_LABEL) {
                    BASE_LABEL.to_string()
                } else {
                    let pick = donors
                        .iter()
                        .find(|d| srcs.iter().any(|s| s == *d))
                        .cloned()
                        .or_else(|| srcs.iter().find(|s| *s != BASE_LABEL).cloned())
                        .unwrap_or_else(|| BASE_LABEL.to_string());
                    if pick != BASE_LABEL {
                        is_implicit = true;
                    }
                    pick
                }
            }
        };

        *planned_counts.entry(planned.clone()).or_insert(0) += 1;

        // Overrides: the song exists in Base but the user explicitly routes
        // it to a non-base donor.
        if planned != BASE_LABEL {
            let explicitly_non_base = explicit.is_some_and(|e| e != BASE_LABEL);
            if explicitly_non_base && srcs.iter().any(|s| s == BASE_LABEL) {
                *override_counts.entry(planned.clone()).or_insert(0) += 1;
            }
            if is_implicit {
                *implicit_counts.entry(planned.clone()).or_insert(0) += 1;
            }
        }
    }

    let donors_in_plan: BTreeSet<&String> =
        planned_counts.iter().filter(|(k, v)| k.as_str() != BASE_LABEL && **v > 0).map(|(k, _)| k).collect();
    let unused_needed: Vec<String> = needed.iter().filter(|d| !donors_in_plan.contains(d)).cloned().collect();

    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("{} - Preflight summary", crate::common::TOOL_NAME));
    lines.push(format!("Timestamp: {}", Local::now().format("%Y-%m-%dT%H:%M:%S")));
    lines.push(format!("Output folder: {}", out_dir.display()));
    lines.push(String::new());
    lines.push(format!("Included songs: {}", selected_song_ids.len()));
    lines.push(String::new());
    lines.push("Planned song sources:".to_string());
    lines.push(format!("  Base: {}", planned_counts.get(BASE_LABEL).copied().unwrap_or(0)));

    for d in &donors {
        let n = planned_counts.get(d).copied().unwrap_or(0);
        if n == 0 {
            continue;
        }
        let ov = override_counts.get(d).copied().unwrap_or(0);
        let imp = implicit_counts.get(d).copied().unwrap_or(0);
        let mut extra: Vec<String> = Vec::new();
        if ov > 0 {
            extra.push(format!("overrides {ov}"));
        }
        if imp > 0 {
            extra.push(format!("implicit {imp}"));
        }
        let suffix = if extra.is_empty() { String::new() } else { format!(" ({})", extra.join(", ")) };
        lines.push(format!("  {d}: {n}{suffix}"));
    }
    // Any planned winners outside the declared donor order.
    for (d, n) in &planned_counts {
        if d != BASE_LABEL && !donors.contains(d) && *n > 0 {
            lines.push(format!("  {d}: {n}"));
        }
    }

    lines.push(String::new());
    lines.push("Donors:".to_string());
    if needed.is_empty() {
        lines.push("  Needed donors: (none)".to_string());
    } else {
        lines.push(format!("  Needed donors: {}", needed.iter().cloned().collect::<Vec<_>>().join(", ")));
    }
    if !unused_needed.is_empty() {
        lines.push(format!("  Unused donors (no songs routed): {}", unused_needed.join(", ")));
    }

    lines.push(String::new());
    lines.push("Duplicates across sources:".to_string());
    lines.push(format!("  Songs appearing in 2+ sources: {songs_with_dups}"));
    if songs_with_dups > 0 {
        lines.push(
            "  Note: identical duplicates are auto-handled; non-identical will block the build until resolved."
                .to_string(),
        );
    }

    if !mismatched_prefs.is_empty() {
        lines.push(String::new());
        lines.push("Potential issues:".to_string());
        lines.push(format!("  Preferred source doesn't contain song: {}", ids_preview(&mismatched_prefs, 30)));
    }

    // Key log lines (keep concise).
    let mut log_lines: Vec<String> = Vec::new();
    let base_n = planned_counts.get(BASE_LABEL).copied().unwrap_or(0);
    let donor_parts: Vec<String> = donors
        .iter()
        .filter_map(|d| {
            let n = planned_counts.get(d).copied().unwrap_or(0);
            (n > 0).then(|| format!("{d} {n}"))
        })
        .collect();
    let donors_str = if donor_parts.is_empty() { "(no donors)".to_string() } else { donor_parts.join(", ") };
    log_lines.push(format!("Build plan: {} songs -> Base {base_n}, {donors_str}", selected_song_ids.len()));
    if songs_with_dups > 0 {
        log_lines.push(format!(
            "Duplicates across sources: {songs_with_dups} song(s) (identical OK; non-identical requires resolution)"
        ));
    }
    if !mismatched_prefs.is_empty() {
        log_lines.push(format!("WARN: preferred source missing song: {}", ids_preview(&mismatched_prefs, 10)));
    }

    let plan = BuildPlan {
        selected_song_count: selected_song_ids.len() as u64,
        planned_counts,
        override_counts,
        implicit_counts,
        songs_with_duplicates: songs_with_dups,
        needed_donors: needed.into_iter().collect(),
        donor_order: donors,
        unused_needed_donors: unused_needed,
        missing_in_all_sources: Vec::new(),
        mismatched_preferred_source: mismatched_prefs,
    };
    (format!("{}\n", lines.join("\n")), log_lines, plan)
}

fn ids_preview(ids: &[u32], limit: usize) -> String {
    let shown: Vec<String> = ids.iter().take(limit).map(|x| x.to_string()).collect();
    if ids.len() > limit {
        format!("{} (+{} more)", shown.join(", "), ids.len() - limit)
    } else {
        shown.join(", ")
    }
}

/// Simple dedupe stats over the selected song set, embedded in the build
/// report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupeStats {
    pub selected_unique: u64,
    pub songs_with_duplicates: u64,
    pub extra_occurrences_hidden: u64,
    pub dup_count_histogram: BTreeMap<String, u64>,
    pub winner_counts: BTreeMap<String, u64>,
}

pub fn compute_dedupe_stats(
    selected_song_ids: &BTreeSet<u32>,
    preferred_source_by_song_id: &BTreeMap<u32, String>,
    song_sources_by_id: Option<&BTreeMap<u32, Vec<String>>>,
) -> DedupeStats {
    let mut stats = DedupeStats {
        selected_unique: selected_song_ids.len() as u64,
        ..Default::default()
    };

    for &sid in selected_song_ids {
        let winner = preferred_source_by_song_id.get(&sid).cloned().unwrap_or_else(|| BASE_LABEL.to_string());
        *stats.winner_counts.entry(winner).or_insert(0) += 1;
    }

    let sources = match song_sources_by_id {
        Some(m) => m,
        None => return stats,
    };
    for &sid in selected_song_ids {
        let srcs = uniq_keep_order(sources.get(&sid).map(|v| v.as_slice()).unwrap_or(&[]));
        let k = srcs.len() as u64;
        if k > 1 {
            stats.songs_with_duplicates += 1;
            stats.extra_occurrences_hidden += k - 1;
        }
        *stats.dup_count_histogram.entry(k.to_string()).or_insert(0) += 1;
    }
    stats
}
