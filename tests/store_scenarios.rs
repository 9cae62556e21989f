//! End-to-end store scenarios: seeding, delta sync, merge convergence.
use deepboard::store::Store;
use deepboard::text::Text;
use deepboard::types::connection_counts;

fn setup(node_id: &str) -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(&dir.path().join("board.db"), node_id, Vec::new()).unwrap();
    (store, dir)
}

#[test]
fn fresh_db_seeds_the_initial_board() {
    let (store, _dir) = setup("node-1");
    let state = store.get_board();

    assert_eq!(state.board.id, "main-board");
    assert_eq!(state.board.columns.len(), 3);

    let card = &state.board.cards["card-1"];
    assert_eq!(card.column_id, "todo");
    assert!(card
        .description
        .to_string()
        .contains("Explore the features of the deep library."));

    let (local, _) = connection_counts(&state, "node-1");
    assert_eq!(local, 0);
}

#[test]
fn edit_lands_in_board_and_history() {
    let (store, _dir) = setup("node-1");
    let card_id = store.add_card("New Task");

    let state = store.get_board();
    assert!(state.board.cards.contains_key(&card_id));
    assert_eq!(state.board.cards[&card_id].title, "New Task");

    let history = store.get_history(1);
    assert_eq!(history.len(), 1);
    assert!(history[0].contains(&card_id));
}

#[test]
fn delta_from_one_node_applies_on_another() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");

    let delta = s1.edit(|bs, _| bs.board.title = "Updated Title".to_string());
    assert!(s2.apply_delta(&delta));
    assert_eq!(s2.get_board().board.title, "Updated Title");

    // Re-delivery is a no-op.
    assert!(!s2.apply_delta(&delta));
}

#[test]
fn merge_keeps_concurrent_column_renames() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");

    s1.edit(|bs, _| bs.board.columns[1].title = "In Dev".to_string());
    s2.edit(|bs, _| bs.board.columns[2].title = "Finished".to_string());

    assert!(s1.merge(&s2.snapshot()));

    let board = s1.get_board().board;
    assert_eq!(board.columns[1].title, "In Dev");
    assert_eq!(board.columns[2].title, "Finished");
}

#[test]
fn text_edits_converge_across_nodes() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");

    // Clear the seeded description on both sides.
    let cleared = s1.edit(|bs, _| {
        if let Some(card) = bs.board.cards.get_mut("card-1") {
            card.description = Text::new();
        }
    });
    s2.apply_delta(&cleared);

    s1.update_card_text("card-1", "insert", "Hello ", 0, 0);
    s2.merge(&s1.snapshot());
    s2.update_card_text("card-1", "insert", "World", 6, 0);
    s1.merge(&s2.snapshot());

    let final1 = s1.get_board().board.cards["card-1"].description.to_string();
    let final2 = s2.get_board().board.cards["card-1"].description.to_string();
    assert_eq!(final1, final2);
    assert_eq!(final1, "Hello World");
}

#[test]
fn card_operations_round_trip() {
    let (store, _dir) = setup("node-1");

    let card_id = store.add_card("Operation Task");
    let state = store.get_board();
    let todo_count = state
        .board
        .cards
        .values()
        .filter(|c| c.column_id == "todo")
        .count();
    assert_eq!(todo_count, 2);

    store.move_card(&card_id, "in-progress", 0);
    let card = store.get_board().board.cards[&card_id].clone();
    assert_eq!(card.column_id, "in-progress");

    store.update_card_text(&card_id, "insert", "Detailed description", 0, 0);
    let desc = store.get_board().board.cards[&card_id]
        .description
        .to_string();
    assert!(desc.contains("Detailed description"));

    store.update_card_text(&card_id, "delete", "", 0, 9);
    let desc = store.get_board().board.cards[&card_id]
        .description
        .to_string();
    assert_eq!(desc, "description");

    store.delete_card(&card_id);
    assert!(!store.get_board().board.cards.contains_key(&card_id));
}

#[test]
fn mutations_on_missing_cards_are_noops() {
    let (store, _dir) = setup("node-1");
    let before = store.get_history(50).len();

    store.move_card("no-such-card", "done", 0);
    store.update_card_text("no-such-card", "insert", "x", 0, 0);
    store.delete_card("no-such-card");

    assert_eq!(store.get_history(50).len(), before);
    assert_eq!(store.get_board().board.cards.len(), 1);
}

#[test]
fn three_way_concurrent_operations_converge() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");
    let (s3, _d3) = setup("node-3");

    let card_id = s1.add_card("Concurrency Test Card");
    s2.merge(&s1.snapshot());
    s3.merge(&s1.snapshot());

    s1.update_card_text(&card_id, "insert", " from 1", 0, 0);
    s2.update_card_text(&card_id, "insert", "Node 2: ", 0, 0);
    s3.move_card(&card_id, "done", 0);

    // Full mesh of pairwise merges.
    s1.merge(&s2.snapshot());
    s1.merge(&s3.snapshot());
    s2.merge(&s1.snapshot());
    s2.merge(&s3.snapshot());
    s3.merge(&s1.snapshot());
    s3.merge(&s2.snapshot());

    let b1 = s1.get_board().board;
    let b2 = s2.get_board().board;
    let b3 = s3.get_board().board;

    let j1 = serde_json::to_vec(&b1).unwrap();
    let j2 = serde_json::to_vec(&b2).unwrap();
    let j3 = serde_json::to_vec(&b3).unwrap();
    assert_eq!(j1, j2);
    assert_eq!(j1, j3);

    let card = &b1.cards[&card_id];
    assert_eq!(card.column_id, "done");
    let text = card.description.to_string();
    assert!(text.contains("Node 2:"), "missing node-2 edit in {text:?}");
    assert!(text.contains("from 1"), "missing node-1 edit in {text:?}");
}

#[test]
fn deleted_cards_stay_deleted_after_merge() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");

    s1.delete_card("card-1");
    s1.merge(&s2.snapshot());
    assert!(!s1.get_board().board.cards.contains_key("card-1"));

    s2.merge(&s1.snapshot());
    assert!(!s2.get_board().board.cards.contains_key("card-1"));
}

#[test]
fn reset_restores_the_seed_board() {
    let (store, _dir) = setup("node-1");
    store.add_card("To be deleted");
    assert_eq!(store.get_board().board.cards.len(), 2);

    store.reset();

    let state = store.get_board();
    assert_eq!(state.board.cards.len(), 1);
    assert!(state.board.cards.contains_key("card-1"));
    assert!(store.get_history(10).is_empty());
}

#[test]
fn clear_history_keeps_board_state() {
    let (store, _dir) = setup("node-1");
    let card_id = store.add_card("Survivor");
    assert!(!store.get_history(10).is_empty());

    store.clear_history();
    assert!(store.get_history(10).is_empty());
    assert!(store.get_board().board.cards.contains_key(&card_id));
}

#[test]
fn merge_appends_no_history_entry() {
    let (s1, _d1) = setup("node-1");
    let (s2, _d2) = setup("node-2");

    s2.edit(|bs, _| bs.board.title = "Changed Elsewhere".to_string());
    let before = s1.get_history(50).len();
    assert!(s1.merge(&s2.snapshot()));
    assert_eq!(s1.get_history(50).len(), before);
    assert_eq!(s1.get_board().board.title, "Changed Elsewhere");
}
