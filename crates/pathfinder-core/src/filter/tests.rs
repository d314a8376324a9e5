use super::{Filter, FilterError};
use crate::props::Props;

fn props(pairs: &[(&str, &str)]) -> Props {
    let mut props = Props::new();
    for (key, value) in pairs {
        props.add(*key, *value);
    }
    props
}

fn matches(filter: &str, props: &Props) -> bool {
    Filter::parse(filter).unwrap().matches(props)
}

#[test]
fn equality_matches_exact_string() {
    let p = props(&[("name", "echo")]);
    assert!(matches("(name=echo)", &p));
    assert!(!matches("(name=Echo)", &p));
    assert!(!matches("(name=echo2)", &p));
    assert!(!matches("(other=echo)", &p));
}

#[test]
fn equality_matches_any_of_multiple_values() {
    let mut p = Props::new();
    p.add("addr", "tcp:10.0.0.1:4711");
    p.add("addr", "tcp:10.0.0.2:4711");
    assert!(matches("(addr=tcp:10.0.0.2:4711)", &p));
    assert!(!matches("(addr=tcp:10.0.0.3:4711)", &p));
}

#[test]
fn numeric_literal_matches_int_and_string_spelling() {
    let mut p = Props::new();
    p.add("port", 4711);
    assert!(matches("(port=4711)", &p));
    assert!(!matches("(port=471)", &p));

    let q = props(&[("port", "4711")]);
    assert!(matches("(port=4711)", &q));
}

#[test]
fn presence_matches_any_value() {
    let mut p = Props::new();
    p.add("color", "green");
    assert!(matches("(color=*)", &p));
    assert!(!matches("(shape=*)", &p));

    let mut q = Props::new();
    q.add("weight", 3);
    assert!(matches("(weight=*)", &q));
}

#[test]
fn glob_has_substring_semantics() {
    let p = props(&[("name", "echo-server-1")]);
    assert!(matches("(name=echo*)", &p));
    assert!(matches("(name=*server*)", &p));
    assert!(matches("(name=*-1)", &p));
    assert!(matches("(name=echo*1)", &p));
    assert!(matches("(name=e*o*1)", &p));
    assert!(!matches("(name=*server)", &p));
    assert!(!matches("(name=server*)", &p));
}

#[test]
fn glob_segments_must_occur_in_order() {
    let p = props(&[("name", "aba")]);
    assert!(matches("(name=a*a)", &p));
    assert!(!matches("(name=ab*ba)", &p));
}

#[test]
fn glob_never_matches_integer_values() {
    let mut p = Props::new();
    p.add("port", 4711);
    assert!(!matches("(port=47*)", &p));
}

#[test]
fn integer_comparisons() {
    let mut p = Props::new();
    p.add("weight", 10);
    assert!(matches("(weight>9)", &p));
    assert!(matches("(weight>=10)", &p));
    assert!(matches("(weight<11)", &p));
    assert!(matches("(weight<=10)", &p));
    assert!(!matches("(weight>10)", &p));
    assert!(!matches("(weight<10)", &p));
    assert!(!matches("(weight>=11)", &p));
    assert!(!matches("(weight<=9)", &p));
}

#[test]
fn comparisons_ignore_string_values() {
    let p = props(&[("weight", "10")]);
    assert!(!matches("(weight>9)", &p));
    assert!(!matches("(weight<11)", &p));
}

#[test]
fn negative_bounds_parse() {
    let mut p = Props::new();
    p.add("temp", -5);
    assert!(matches("(temp>-10)", &p));
    assert!(!matches("(temp>-5)", &p));
    assert!(matches("(temp<=-5)", &p));
}

#[test]
fn composites() {
    let mut p = Props::new();
    p.add("name", "echo");
    p.add("port", 4711);

    assert!(matches("(&(name=echo)(port=4711))", &p));
    assert!(!matches("(&(name=echo)(port=80))", &p));
    assert!(matches("(|(name=relay)(port=4711))", &p));
    assert!(!matches("(|(name=relay)(port=80))", &p));
    assert!(matches("(!(name=relay))", &p));
    assert!(!matches("(!(name=echo))", &p));
    assert!(matches("(&(name=echo)(!(|(port<1024)(port>49151))))", &p));
}

#[test]
fn escapes_make_metacharacters_literal() {
    let p = props(&[("expr", "a=b*c")]);
    assert!(matches(r"(expr=a\=b\*c)", &p));
    assert!(!matches(r"(expr=a\=b\*d)", &p));

    let q = props(&[("na(me)", "x")]);
    assert!(matches(r"(na\(me\)=x)", &q));
}

#[test]
fn escaped_wildcard_is_not_presence() {
    let p = props(&[("name", "*")]);
    assert!(matches(r"(name=\*)", &p));

    let q = props(&[("name", "anything")]);
    assert!(!matches(r"(name=\*)", &q));
}

#[test]
fn syntax_errors() {
    for text in [
        "",
        "(",
        "()",
        "(name=x",
        "(name=x))",
        "(&)",
        "(|)",
        "(!)",
        "(=x)",
        "(name)",
        "(name>abc)",
        "(name>1*)",
        "(a=1)(b=2)",
        r"(name=x\",
    ] {
        let err = Filter::parse(text).unwrap_err();
        assert!(
            matches!(err, FilterError::Syntax { .. }),
            "{text:?} should be a syntax error, got {err:?}"
        );
    }
}

#[test]
fn syntax_error_reports_offset() {
    let err = Filter::parse("(name=x").unwrap_err();
    assert_eq!(
        err,
        FilterError::Syntax {
            offset: 7,
            reason: "expected ')'"
        }
    );
}

#[test]
fn node_count_counts_every_node() {
    assert_eq!(Filter::parse("(name=x)").unwrap().node_count(), 1);
    assert_eq!(Filter::parse("(!(name=x))").unwrap().node_count(), 2);
    assert_eq!(
        Filter::parse("(&(name=x)(port>1)(port<9))").unwrap().node_count(),
        4
    );
    assert_eq!(
        Filter::parse("(|(&(a=1)(b=2))(!(c=3)))").unwrap().node_count(),
        6
    );
}

#[test]
fn filter_round_trip_against_witness() {
    // Every compiled filter matches a property set constructed to
    // satisfy it.
    let mut p = Props::new();
    p.add("name", "echo");
    p.add("port", 4711);
    p.add("tag", "blue");

    for text in [
        "(name=echo)",
        "(name=e*)",
        "(port>4000)",
        "(port<=4711)",
        "(tag=*)",
        "(&(name=echo)(port>=4711)(|(tag=blue)(tag=red)))",
        "(!(name=relay))",
    ] {
        assert!(matches(text, &p), "{text} should match witness");
    }
}
