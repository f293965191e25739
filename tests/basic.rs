mod common;

use common::with_map;
use moult::HashMap;

#[test]
fn new() {
    with_map::<usize, usize>(|map| drop(map()));
}

#[test]
fn get_empty() {
    with_map::<usize, usize>(|map| {
        let map = map();
        assert_eq!(map.pin().get(42), None);
    });
}

#[test]
fn put_and_get() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        assert!(m.put(42, 1));
        assert_eq!(m.get(42), Some(1));
        assert!(m.contains_key(42));
        assert!(!m.contains_key(43));
    });
}

#[test]
fn put_overwrites() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        m.put(42, 1);
        m.put(42, 2);
        assert_eq!(m.get(42), Some(2));
        assert_eq!(m.len(), 1);
    });
}

// Crossing the fullness threshold migrates the live entries into a larger
// successor without losing any of them.
#[test]
fn grows_past_fullness() {
    let map = HashMap::builder().capacity(1).density(0.5).build();
    let m = map.pin();

    m.put(7usize, 70usize);
    m.put(9, 90);
    m.put(11, 110);
    m.put(13, 130);

    assert_eq!(m.get(7), Some(70));
    assert_eq!(m.get(9), Some(90));
    assert_eq!(m.get(11), Some(110));
    assert_eq!(m.get(13), Some(130));
    assert_eq!(m.len(), 4);
}

#[test]
fn delete_then_reinsert() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        m.put(1, 1);
        assert!(m.remove(1));
        assert_eq!(m.get(1), None);

        assert!(!m.put_if_exists(1, 2));
        assert!(m.put_if_absent(1, 2));
        assert_eq!(m.get(1), Some(2));
    });
}

#[test]
fn conditional_replace() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        // The key is absent, so nothing can match.
        assert!(!m.put_if_match(5, 50, 49));

        m.put(5, 49);
        assert!(m.put_if_match(5, 50, 49));
        assert_eq!(m.get(5), Some(50));

        assert!(!m.put_if_match(5, 60, 49));
        assert_eq!(m.get(5), Some(50));
    });
}

#[test]
fn put_if_absent_wins_once() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        assert!(m.put_if_absent(1, 10));
        assert!(!m.put_if_absent(1, 20));
        assert_eq!(m.get(1), Some(10));
    });
}

#[test]
fn remove_is_idempotent() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        m.put(1, 10);
        assert!(m.remove(1));
        assert!(!m.remove(1));
        assert_eq!(m.get(1), None);
    });
}

#[test]
fn remove_missing() {
    with_map::<usize, usize>(|map| {
        let map = map();
        assert!(!map.pin().remove(42));
    });
}

#[test]
fn remove_if_match() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        m.put(1, 10);
        assert!(!m.remove_if_match(1, 11));
        assert_eq!(m.get(1), Some(10));

        assert!(m.remove_if_match(1, 10));
        assert_eq!(m.get(1), None);
    });
}

#[test]
fn len_counts_live_entries() {
    with_map::<usize, usize>(|map| {
        let map = map();
        let m = map.pin();

        assert!(m.is_empty());

        m.put(1, 10);
        m.put(2, 20);
        m.put(3, 30);
        assert_eq!(m.len(), 3);

        // Overwrites do not change the count.
        m.put(2, 21);
        assert_eq!(m.len(), 3);

        m.remove(1);
        assert_eq!(m.len(), 2);

        // Removing an absent key changes nothing.
        m.remove(9);
        assert_eq!(m.len(), 2);
    });
}

#[test]
fn many_keys_survive_growth() {
    let map = HashMap::builder().capacity(1).density(0.5).build();
    let m = map.pin();

    for i in 0..2048usize {
        m.put(i, i * 2 + 1);
    }
    assert_eq!(m.len(), 2048);

    for i in 0..2048 {
        assert_eq!(m.get(i), Some(i * 2 + 1));
    }

    for i in (0..2048).step_by(2) {
        assert!(m.remove(i));
    }
    assert_eq!(m.len(), 1024);

    for i in 0..2048 {
        if i % 2 == 0 {
            assert_eq!(m.get(i), None);
        } else {
            assert_eq!(m.get(i), Some(i * 2 + 1));
        }
    }
}

#[test]
fn iter_yields_live_entries() {
    with_map::<usize, usize>(|map| {
        let mut map = map();
        {
            let m = map.pin();
            m.put(1, 10);
            m.put(2, 20);
            m.put(3, 30);
            m.remove(2);
        }

        let mut entries: Vec<_> = map.iter().collect();
        entries.sort_unstable();
        assert_eq!(entries, [(1, 10), (3, 30)]);
    });
}

#[test]
fn iter_after_growth() {
    let mut map = HashMap::builder().capacity(1).density(0.5).build();
    {
        let m = map.pin();
        for i in 0..512usize {
            m.put(i, i);
        }
    }

    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_unstable();

    let expected: Vec<_> = (0..512usize).map(|i| (i, i)).collect();
    assert_eq!(entries, expected);
}

#[test]
fn clone_copies_entries() {
    let map = HashMap::builder().capacity(4).density(0.5).build();
    {
        let m = map.pin();
        for i in 0..128usize {
            m.put(i, i + 1);
        }
    }

    let copy = map.clone();
    let c = copy.pin();
    assert_eq!(c.len(), 128);
    for i in 0..128 {
        assert_eq!(c.get(i), Some(i + 1));
    }

    // The copy is independent of the source.
    c.put(1000, 1);
    assert_eq!(map.pin().get(1000), None);
}

#[test]
fn debug_formats_entries() {
    let map: HashMap<usize, usize> = HashMap::new();
    map.pin().put(7, 70);
    assert_eq!(format!("{map:?}"), "{7: 70}");
}

#[test]
#[should_panic(expected = "reserved")]
fn reserved_key_panics() {
    // The empty-slot word for word-sized keys.
    const KEY_NONE: usize = (usize::MAX >> 1) - 3;

    let map: HashMap<usize, usize> = HashMap::new();
    map.pin().put(KEY_NONE, 1);
}

#[test]
#[should_panic(expected = "reserved")]
fn reserved_value_panics() {
    // The lowest sentinel codepoint of the value domain.
    const VALUE_NONE: usize = (usize::MAX >> 1) - 3;

    let map: HashMap<usize, usize> = HashMap::new();
    map.pin().put(1, VALUE_NONE);
}

#[test]
#[should_panic(expected = "reserved")]
fn tagged_value_panics() {
    let map: HashMap<usize, usize> = HashMap::new();
    map.pin().put(1, usize::MAX);
}

#[test]
#[should_panic(expected = "capacity")]
fn zero_capacity_panics() {
    let _: HashMap<usize, usize> = HashMap::with_capacity(0);
}

#[test]
#[should_panic(expected = "density")]
fn unit_density_panics() {
    let _: HashMap<usize, usize> = HashMap::builder().density(1.0).build();
}
