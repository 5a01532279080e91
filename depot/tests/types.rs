//! Property testing for descriptor validation and round-tripping.

use std::collections::BTreeMap;

use proptest::{collection::vec, option, prop_oneof, proptest, strategy::Strategy};

use depot::{ExactClasses, Type, Value};

// A descriptor together with a strategy for values it accepts.
fn typed_values() -> impl Strategy<Value = (Type, Value)> {
    prop_oneof![
        proptest::bool::ANY.prop_map(|b| (Type::Bool, Value::Bool(b))),
        proptest::num::i64::ANY.prop_map(|i| (Type::Integer, Value::Int(i))),
        (0_i64..i64::max_value()).prop_map(|i| (Type::Positive, Value::Int(i))),
        proptest::num::f64::NORMAL.prop_map(|f| (Type::Float, Value::Float(f))),
        "[a-zA-Z0-9 ]{0,40}".prop_map(|s| (Type::String, Value::String(s))),
        vec(proptest::num::u8::ANY, 0..256).prop_map(|b| (Type::Binary, Value::Bytes(b))),
        vec(proptest::num::i64::ANY, 0..16)
            .prop_map(|items| {
                (
                    Type::list(Type::Integer),
                    Value::List(items.into_iter().map(Value::Int).collect()),
                )
            }),
        (proptest::num::i64::ANY, "[a-z]{0,8}").prop_map(|(i, s)| {
            (
                Type::Tuple(vec![Type::Integer, Type::String]),
                Value::List(vec![Value::Int(i), Value::String(s)]),
            )
        }),
        (option::of("[a-z]{1,8}"), option::of(proptest::num::i64::ANY)).prop_map(|(s, i)| {
            let mut fields = BTreeMap::new();
            fields.insert("label".to_owned(), Type::String);
            fields.insert("count".to_owned(), Type::Integer);
            let mut entries = BTreeMap::new();
            if let Some(s) = s {
                entries.insert("label".to_owned(), Value::String(s));
            }
            if let Some(i) = i {
                entries.insert("count".to_owned(), Value::Int(i));
            }
            (Type::Map(fields), Value::Map(entries))
        }),
    ]
}

proptest! {
    #[test]
    fn serialization_round_trips_validated_values((ty, value) in typed_values()) {
        let validated = ty.validate(&value, "prop", &ExactClasses).unwrap();
        let primitive = ty.serialize(&validated).unwrap();
        let decoded = ty.deserialize(&primitive).unwrap();
        assert_eq!(decoded, validated);
    }

    #[test]
    fn validation_is_idempotent((ty, value) in typed_values()) {
        let once = ty.validate(&value, "prop", &ExactClasses).unwrap();
        let twice = ty.validate(&once, "prop", &ExactClasses).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn encoded_records_preserve_primitives((ty, value) in typed_values()) {
        // What a backend stores and returns must decode to the same
        // primitive tree the descriptor produced.
        let validated = ty.validate(&value, "prop", &ExactClasses).unwrap();
        let primitive = ty.serialize(&validated).unwrap();
        let bytes = serde_json::to_vec(&primitive).unwrap();
        let reread: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ty.deserialize(&reread).unwrap(), validated);
    }

    #[test]
    fn ranges_accept_exactly_their_bounds(lo in -1000_i64..0, hi in 0_i64..1000, x in -2000_i64..2000) {
        let ty = Type::range(lo as f64, hi as f64, Type::Integer);
        let ok = ty.validate(&Value::Int(x), "n", &ExactClasses).is_ok();
        assert_eq!(ok, x >= lo && x <= hi);
    }

    #[test]
    fn lines_reject_exactly_the_strings_with_newlines(s in "[a-z \n\r]{0,20}") {
        let ok = Type::Line.validate(&Value::String(s.clone()), "line", &ExactClasses).is_ok();
        assert_eq!(ok, !s.contains('\n') && !s.contains('\r'));
    }
}

#[test]
fn float_json_round_trip_keeps_integral_floats_apart() {
    // A whole-valued float comes back as an integer from a JSON codec; the
    // descriptor restores the float representation.
    let primitive = Type::Float.serialize(&Value::Float(3.0)).unwrap();
    let bytes = serde_json::to_vec(&primitive).unwrap();
    let reread: Value = serde_json::from_slice(&bytes).unwrap();
    let decoded = Type::Float
        .validate(&reread, "f", &ExactClasses)
        .unwrap();
    assert_eq!(decoded, Value::Float(3.0));
}

#[test]
fn one_of_picks_the_first_matching_alternative() {
    let ty = Type::OneOf(vec![Type::Integer, Type::String]);
    assert_eq!(
        ty.validate(&Value::from(3), "v", &ExactClasses).unwrap(),
        Value::Int(3)
    );
    assert_eq!(
        ty.validate(&Value::from("three"), "v", &ExactClasses).unwrap(),
        Value::from("three")
    );
    assert!(ty.validate(&Value::Bool(true), "v", &ExactClasses).is_err());
}
