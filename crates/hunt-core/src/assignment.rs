//! Deterministic per-participant link assignment.
//!
//! Every participant sees the same fixed catalogue of candidate slots, but
//! which slots render a link, and which single slot (if any) carries the
//! genuine round-two link, is a pure function of the participant id. No
//! state, no I/O, no clock: two calls with the same id are byte-identical,
//! across processes and restarts.

use contracts::AssignmentResult;

/// Fixed slot catalogue, in the order every caller must use. Index matters:
/// the genuine-slot selection below is relative to this ordering.
pub const LINK_LOCATIONS: [(&str, &str, &str); 20] = [
    ("about", "header", "right"),
    ("about", "mission", "bottom"),
    ("about", "team", "middle"),
    ("about", "footer", "left"),
    ("contact", "header", "top"),
    ("contact", "form", "right"),
    ("contact", "map", "bottom"),
    ("contact", "footer", "middle"),
    ("courses", "header", "left"),
    ("courses", "list", "top"),
    ("courses", "details", "right"),
    ("courses", "footer", "bottom"),
    ("pricing", "header", "middle"),
    ("pricing", "plans", "left"),
    ("pricing", "faq", "top"),
    ("pricing", "footer", "right"),
    ("journal", "header", "bottom"),
    ("journal", "articles", "middle"),
    ("journal", "sidebar", "left"),
    ("journal", "footer", "top"),
];

/// Destinations handed out for visible decoy slots.
pub const DECOY_DESTINATIONS: [&str; 10] = [
    "/decoy/page1",
    "/decoy/page2",
    "/decoy/page3",
    "/decoy/page4",
    "/decoy/page5",
    "/decoy/clue1",
    "/decoy/clue2",
    "/decoy/clue3",
    "/decoy/hint1",
    "/decoy/hint2",
];

/// Where a genuine link lands.
pub const ROUND_TWO_TARGET: &str = "/hunt/round-two";

/// Per-slot entry paths revealed on the round-two page; one per quota slot.
/// Destination validation accepts any of these exactly.
pub const ROUND_TWO_ENTRY_PATHS: [&str; 15] = [
    "/roundtwo-k4v9mp2qx8w1rtz7",
    "/roundtwo-e3ah61dn5o9cufy2",
    "/roundtwo-p8s2lg7bjw4qe0m5",
    "/roundtwo-z1xr6tc3vk9dn4ha",
    "/roundtwo-m7qy0fw2el8ubs3j",
    "/roundtwo-t5dk9ar1ph6zxo4c",
    "/roundtwo-b2nv8ej4gq0wml7y",
    "/roundtwo-h9cf3us6ty1rka5d",
    "/roundtwo-w0lp5mx7az2bng8e",
    "/roundtwo-r6jt1qd9ov3yhc2k",
    "/roundtwo-f4ge8bw0sn7mup1x",
    "/roundtwo-c3za7ky5ir9dql6v",
    "/roundtwo-n1oh6vp8fm2tex0s",
    "/roundtwo-y8ub2wl4ck5gjr3q",
    "/roundtwo-s7md0xe3nt6avi9p",
];

/// Lenient fallback accepted by destination validation; tolerates minor
/// client-side formatting drift in the submitted path.
pub const ROUND_TWO_ENTRY_PREFIX: &str = "/roundtwo-";

/// 32-bit string hash matching the hash the game has always used: for each
/// UTF-16 code unit, `h = (h << 5) - h + unit` in wrapping signed arithmetic,
/// taken as its absolute value. Well-distributed, stable, and intentionally
/// not cryptographic. The empty id hashes to 0.
pub fn stable_hash(participant_id: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in participant_id.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs()
}

/// Stable identifier for one (participant, slot) pair, used by click audit.
pub fn link_id(participant_id: &str, page: &str, section: &str, position: &str) -> String {
    format!("link-{participant_id}-{page}-{section}-{position}")
}

fn slot_assignment(
    hash: u64,
    index: usize,
    page: &str,
    section: &str,
    position: &str,
    participant_id: &str,
) -> AssignmentResult {
    let slot = hash + index as u64;
    let catalogue_len = LINK_LOCATIONS.len() as u64;

    // Roughly a third of the catalogue renders for any given participant.
    let visible = slot % 3 == 0;
    let is_real = visible && slot % catalogue_len == hash % catalogue_len;

    let destination = if is_real {
        ROUND_TWO_TARGET.to_string()
    } else {
        DECOY_DESTINATIONS[(slot % DECOY_DESTINATIONS.len() as u64) as usize].to_string()
    };

    AssignmentResult {
        page: page.to_string(),
        section: section.to_string(),
        position: position.to_string(),
        link_id: link_id(participant_id, page, section, position),
        visible,
        is_real,
        destination,
    }
}

/// Full assignment table for one participant, catalogue order.
pub fn assignments_for_participant(participant_id: &str) -> Vec<AssignmentResult> {
    let hash = u64::from(stable_hash(participant_id));
    LINK_LOCATIONS
        .iter()
        .enumerate()
        .map(|(index, &(page, section, position))| {
            slot_assignment(hash, index, page, section, position, participant_id)
        })
        .collect()
}

/// Assignment rows for the slots on a single page.
pub fn assignments_for_page(participant_id: &str, page: &str) -> Vec<AssignmentResult> {
    assignments_for_participant(participant_id)
        .into_iter()
        .filter(|assignment| assignment.page == page)
        .collect()
}

/// The genuine destination for this participant, if their genuine slot is
/// actually rendered. A participant whose genuine slot falls on a hidden
/// index has no reachable genuine link this session.
pub fn reachable_genuine_destination(participant_id: &str) -> Option<&'static str> {
    let hash = u64::from(stable_hash(participant_id));
    let catalogue_len = LINK_LOCATIONS.len() as u64;

    (0..LINK_LOCATIONS.len()).find_map(|index| {
        let slot = hash + index as u64;
        let visible = slot % 3 == 0;
        let is_real = visible && slot % catalogue_len == hash % catalogue_len;
        is_real.then_some(ROUND_TWO_TARGET)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_yields_byte_identical_assignments() {
        let first = assignments_for_participant("abc-123");
        let second = assignments_for_participant("abc-123");

        let first_json = serde_json::to_string(&first).expect("assignments serialize");
        let second_json = serde_json::to_string(&second).expect("assignments serialize");
        assert_eq!(first_json, second_json);
    }

    #[test]
    fn at_most_one_genuine_link_per_participant() {
        for id in ["abc-123", "", "x", "another-participant", "Ω-unicode-id"] {
            let real_count = assignments_for_participant(id)
                .iter()
                .filter(|assignment| assignment.is_real)
                .count();
            assert!(real_count <= 1, "id {id:?} got {real_count} genuine links");
        }
    }

    #[test]
    fn catalogue_scenario_is_stable() {
        let assignments = assignments_for_participant("abc-123");
        assert_eq!(assignments.len(), LINK_LOCATIONS.len());

        let visible = assignments.iter().filter(|a| a.visible).count();
        // ~1/3 of 20 slots; exact split depends only on the hash.
        assert!((5..=9).contains(&visible), "visible count {visible}");

        for assignment in &assignments {
            if assignment.visible && !assignment.is_real {
                assert!(DECOY_DESTINATIONS.contains(&assignment.destination.as_str()));
            }
            if assignment.is_real {
                assert_eq!(assignment.destination, ROUND_TWO_TARGET);
            }
        }
    }

    #[test]
    fn real_slot_is_always_catalogue_index_zero() {
        // (h + i) % N == h % N forces i == 0 for 0 <= i < N, so the genuine
        // slot is pinned to the first catalogue entry and is reachable only
        // when the hash makes that slot visible (h % 3 == 0).
        for seed in 0..64_u32 {
            let id = format!("participant-{seed}");
            let assignments = assignments_for_participant(&id);
            for (index, assignment) in assignments.iter().enumerate() {
                if assignment.is_real {
                    assert_eq!(index, 0, "id {id} marked slot {index} genuine");
                }
            }

            let hash = stable_hash(&id);
            let expect_reachable = hash % 3 == 0;
            assert_eq!(
                reachable_genuine_destination(&id).is_some(),
                expect_reachable,
                "id {id} hash {hash}"
            );
        }
    }

    #[test]
    fn roughly_a_third_of_participants_have_a_reachable_genuine_link() {
        let reachable = (0..300)
            .filter(|seed| reachable_genuine_destination(&format!("participant-{seed}")).is_some())
            .count();

        assert!(
            (60..=140).contains(&reachable),
            "expected ~100/300 reachable, got {reachable}"
        );
    }

    #[test]
    fn empty_id_hashes_to_zero_and_still_gets_a_table() {
        assert_eq!(stable_hash(""), 0);

        let assignments = assignments_for_participant("");
        assert_eq!(assignments.len(), LINK_LOCATIONS.len());
        // hash 0 makes slot 0 both visible and genuine
        assert!(assignments[0].visible);
        assert!(assignments[0].is_real);
    }

    #[test]
    fn page_filter_matches_catalogue_subset() {
        let about = assignments_for_page("abc-123", "about");
        assert_eq!(about.len(), 4);
        assert!(about.iter().all(|assignment| assignment.page == "about"));

        assert!(assignments_for_page("abc-123", "no-such-page").is_empty());
    }

    #[test]
    fn link_ids_encode_participant_and_slot() {
        assert_eq!(
            link_id("p-9", "about", "header", "right"),
            "link-p-9-about-header-right"
        );
    }
}
