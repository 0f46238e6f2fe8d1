use lims_conformity::{
    evaluate, sanitize_input, select_effective, MeasuredValue, ParameterId, ProductContext,
    ProductId, SampleTypeId, Specification, Verdict,
};
use proptest::prelude::*;

fn spec_strategy() -> impl Strategy<Value = Specification> {
    (
        proptest::option::of(-1000.0f64..1000.0),
        proptest::option::of(0.0f64..1000.0),
    )
        .prop_map(|(min, span)| {
            let max = match (min, span) {
                (Some(min), Some(span)) => Some(min + span),
                (None, Some(span)) => Some(span),
                _ => None,
            };
            Specification::global(ParameterId::new(), SampleTypeId::new()).with_range(min, max)
        })
}

proptest! {
    #[test]
    fn prop_evaluate_is_deterministic(value in -2000.0f64..2000.0, spec in spec_strategy()) {
        let v = MeasuredValue::Numeric(value);
        let first = evaluate(&v, Some(&spec));
        for _ in 0..3 {
            prop_assert_eq!(evaluate(&v, Some(&spec)), first);
        }
    }

    #[test]
    fn prop_numeric_verdict_matches_limits(value in -2000.0f64..2000.0, spec in spec_strategy()) {
        let verdict = evaluate(&MeasuredValue::Numeric(value), Some(&spec));
        let below = spec.min_value.is_some_and(|min| value < min);
        let above = spec.max_value.is_some_and(|max| value > max);
        if below || above {
            prop_assert_eq!(verdict, Verdict::Fail);
        } else {
            prop_assert_eq!(verdict, Verdict::Pass);
        }
    }

    #[test]
    fn prop_decimal_comma_equals_decimal_point(int in 0u32..100_000, frac in 0u32..1000) {
        let with_point = MeasuredValue::parse(&format!("{int}.{frac}"));
        let with_comma = MeasuredValue::parse(&format!("{int},{frac}"));
        prop_assert_eq!(&with_point, &with_comma);
        prop_assert!(with_point.as_number().is_some());
    }

    #[test]
    fn prop_sanitized_numeric_input_has_one_separator(a in 0u32..1000, b in 0u32..1000, c in 0u32..1000) {
        let doubled = format!("{a}.{b},{c}");
        prop_assert!(sanitize_input(&doubled).is_err());
        let single = sanitize_input(&format!("{a},{b}")).unwrap();
        prop_assert_eq!(single.matches('.').count(), 1);
    }

    #[test]
    fn prop_resolution_ignores_candidate_order(seed in 0usize..6) {
        let param = ParameterId::new();
        let product = ProductId::new();
        let st = SampleTypeId::new();
        let mut rows = vec![
            Specification::global(param, st),
            Specification::for_product(param, product, None),
            Specification::for_product(param, product, Some(st)),
        ];
        let ctx = ProductContext { product_id: Some(product), sample_type_id: st };
        let expected = select_effective(&rows, &ctx);
        let len = rows.len();
        rows.rotate_left(seed % len);
        if seed >= 3 {
            rows.reverse();
        }
        prop_assert_eq!(select_effective(&rows, &ctx), expected);
    }
}

#[test]
fn test_example_scenarios() {
    let spec = Specification::global(ParameterId::new(), SampleTypeId::new())
        .with_range(Some(6.0), Some(8.0));
    assert_eq!(evaluate(&MeasuredValue::parse("7.5"), Some(&spec)), Verdict::Pass);
    assert_eq!(evaluate(&MeasuredValue::parse("9.0"), Some(&spec)), Verdict::Fail);
    assert_eq!(MeasuredValue::parse("7,5"), MeasuredValue::Numeric(7.5));
}
