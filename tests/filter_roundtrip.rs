use proptest::prelude::*;

use smartcache::{FilterState, Predicate, RelativeRange, Scalar, UrlState};

fn scalar() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        any::<bool>().prop_map(Scalar::Bool),
        any::<i64>().prop_map(Scalar::Int),
        "\\PC{0,12}".prop_map(Scalar::Text),
    ]
}

fn predicate() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        scalar().prop_map(Predicate::Eq),
        prop::collection::vec(scalar(), 1..5).prop_map(Predicate::In),
        prop::collection::vec(scalar(), 1..5).prop_map(Predicate::Overlaps),
        (scalar(), prop::option::of(scalar())).prop_map(|(gte, lte)| Predicate::Range { gte: Some(gte), lte }),
        any::<bool>().prop_map(Predicate::IsNull),
        prop::sample::select(RelativeRange::ALL.to_vec()).prop_map(Predicate::Within),
    ]
}

fn filter_state() -> impl Strategy<Value = FilterState> {
    prop::collection::btree_map("[a-z][a-zA-Z_]{0,10}", predicate(), 0..6).prop_map(|columns| {
        let mut state = FilterState::new();
        for (column, predicate) in columns {
            state.insert(column, predicate).unwrap();
        }
        state
    })
}

proptest! {
    #[test]
    fn decode_inverts_encode(state in filter_state()) {
        let decoded = FilterState::decode(&state.encode()).unwrap();
        prop_assert_eq!(&decoded, &state);
        prop_assert_eq!(decoded.fingerprint(), state.fingerprint());
    }

    #[test]
    fn url_state_survives_the_address_bar(
        filters in filter_state(),
        view in prop::option::of("[a-z_]{1,10}"),
        story in prop::option::of("\\PC{1,10}"),
        page in prop::option::of(1u32..500),
        extra in prop::collection::vec(("utm_[a-z]{1,6}", "\\PC{0,8}"), 0..3),
    ) {
        let state = UrlState { filters, view, story, page, extra };
        let query = state.to_query_string();
        let parsed = UrlState::from_query_string(&format!("?{query}")).unwrap();
        prop_assert_eq!(&parsed, &state);
        prop_assert!(!state.navigation_needed(&query));
    }

    #[test]
    fn set_order_does_not_change_identity(values in prop::collection::vec(scalar(), 1..6), seed in 0usize..16) {
        let mut shuffled = values.clone();
        let len = shuffled.len();
        shuffled.rotate_left(seed % len);
        shuffled.reverse();

        let a = FilterState::new().with("tags", Predicate::Overlaps(values)).unwrap();
        let b = FilterState::new().with("tags", Predicate::Overlaps(shuffled)).unwrap();
        prop_assert_eq!(a.encode(), b.encode());
        prop_assert_eq!(a.fingerprint(), b.fingerprint());
    }
}

#[test]
fn empty_state_has_an_empty_query_string() {
    let state = UrlState::default();
    assert_eq!(state.to_query_string(), "");
    assert!(!state.navigation_needed(""));
    assert!(state.navigation_needed("?filters=%7B%7D&page=2"));
}

#[test]
fn hand_written_url_is_canonicalized() {
    let parsed = UrlState::from_query_string("?page=3&filters=%7B%22status%22%3A%7B%22in%22%3A%5B%22open%22%2C%22closed%22%5D%7D%7D")
        .unwrap();
    assert_eq!(
        parsed.filters.get("status"),
        Some(&Predicate::In(vec!["closed".into(), "open".into()]))
    );
    assert_eq!(parsed.page, Some(3));
    assert_eq!(parsed.to_query_string().split('&').next().map(|p| p.starts_with("filters=")), Some(true));
}

#[test]
fn malformed_filters_are_rejected() {
    assert!(UrlState::from_query_string("filters=%7Bnot-json").is_err());
    assert!(FilterState::decode("%7B%22status%22%3A%7B%22in%22%3A%5B%5D%7D%7D").is_err());
}
