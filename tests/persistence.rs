//! Durability across reopen: committed state survives, uncommitted state
//! does not, and the sequence history stays queryable.

use seqtree::{Cursor, Error, Key, Tree};

fn put(tree: &Tree, k: u64, val: &[u8]) {
    let mut curs = Cursor::new();
    tree.insert(&Key::from_u64(k), val.len(), &mut curs).unwrap();
    curs.val_mut().copy_from_slice(val);
    curs.release();
}

fn get(tree: &Tree, k: u64) -> Option<Vec<u8>> {
    let mut curs = Cursor::new();
    match tree.lookup(&Key::from_u64(k), &mut curs) {
        Ok(()) => {
            let val = curs.val().to_vec();
            curs.release();
            Some(val)
        }
        Err(Error::NotFound) => None,
        Err(err) => panic!("lookup failed: {err}"),
    }
}

#[test]
fn committed_items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    {
        let tree = Tree::create(&path).unwrap();
        for k in 0..300u64 {
            put(&tree, k, format!("v{k}").as_bytes());
        }
        tree.commit().unwrap();
    }

    let tree = Tree::open(&path).unwrap();
    assert!(tree.height() >= 1);
    for k in 0..300u64 {
        assert_eq!(get(&tree, k).unwrap(), format!("v{k}").into_bytes());
    }
}

#[test]
fn uncommitted_changes_are_discarded_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    {
        let tree = Tree::create(&path).unwrap();
        put(&tree, 1, b"durable");
        tree.commit().unwrap();

        put(&tree, 2, b"lost");
        tree.delete(&Key::from_u64(1)).unwrap();
        // no commit
    }

    let tree = Tree::open(&path).unwrap();
    assert_eq!(get(&tree, 1).as_deref(), Some(&b"durable"[..]));
    assert_eq!(get(&tree, 2), None);
}

#[test]
fn the_dirty_sequence_advances_across_commits_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    {
        let tree = Tree::create(&path).unwrap();
        assert_eq!(tree.seq(), 1);
        put(&tree, 1, b"a");
        tree.commit().unwrap();
        assert_eq!(tree.seq(), 2);
        put(&tree, 2, b"b");
        tree.commit().unwrap();
        assert_eq!(tree.seq(), 3);
    }

    let tree = Tree::open(&path).unwrap();
    assert_eq!(tree.seq(), 3);
}

#[test]
fn since_distinguishes_items_by_commit_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    let tree = Tree::create(&path).unwrap();
    for k in 1..=10u64 {
        put(&tree, k, b"gen1");
    }
    tree.commit().unwrap();

    for k in 11..=15u64 {
        put(&tree, k, b"gen2");
    }
    tree.commit().unwrap();
    drop(tree);

    let tree = Tree::open(&path).unwrap();
    let mut curs = Cursor::new();
    let mut second_gen = Vec::new();
    while tree
        .since(&Key::from_u64(1), &Key::from_u64(100), 2, &mut curs)
        .unwrap()
    {
        second_gen.push(curs.key().to_u64());
    }
    assert_eq!(second_gen, vec![11, 12, 13, 14, 15]);
}

#[test]
fn an_empty_committed_tree_reopens_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    {
        let tree = Tree::create(&path).unwrap();
        put(&tree, 1, b"v");
        tree.delete(&Key::from_u64(1)).unwrap();
        tree.commit().unwrap();
    }

    let tree = Tree::open(&path).unwrap();
    assert_eq!(tree.height(), 0);
    assert_eq!(get(&tree, 1), None);
}

#[test]
fn open_rejects_files_that_are_not_a_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-tree.db");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();

    assert!(matches!(Tree::open(&path), Err(Error::Integrity(_))));
}

#[test]
fn many_commit_cycles_recycle_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");

    let tree = Tree::create(&path).unwrap();
    for round in 0..20u64 {
        for k in 0..50u64 {
            put(&tree, round * 1000 + k, &[round as u8; 32]);
        }
        for k in 0..50u64 {
            tree.delete(&Key::from_u64(round * 1000 + k)).unwrap();
        }
        tree.commit().unwrap();
    }

    assert_eq!(tree.height(), 0);
    let len = std::fs::metadata(&path).unwrap().len();
    // copy-on-write churn reuses freed blocks instead of growing the file
    // without bound
    assert!(len < 4096 * 64, "store grew to {len} bytes");
}
