//! Tests for predicate source parsing

use triggerfish_sql::condition::{
    compile, new_field, old_field, parse_predicate, Condition, RowAccess,
};

fn compiled(source: &str) -> String {
    let cond = parse_predicate(source).unwrap();
    compile(&cond, RowAccess::BOTH).unwrap().into_string()
}

fn rejected(source: &str) -> String {
    let err = parse_predicate(source)
        .and_then(|c| compile(&c, RowAccess::BOTH))
        .unwrap_err();
    assert!(err.is_unsupported_expression(), "{:?}", err);
    err.to_string()
}

// ============================================================================
// Accepted Forms
// ============================================================================

#[test]
fn test_status_changed_scenario() {
    assert_eq!(
        compiled("(NEW, OLD) => NEW.status !== OLD.status"),
        r#"NEW."status" IS DISTINCT FROM OLD."status""#
    );
}

#[test]
fn test_equality_spellings() {
    for op in ["=", "==", "==="] {
        assert_eq!(
            compiled(&format!("NEW.status {} 'paid'", op)),
            r#"NEW."status" = 'paid'"#
        );
    }
    for op in ["!=", "!=="] {
        assert_eq!(
            compiled(&format!("NEW.status {} 'paid'", op)),
            r#"NEW."status" <> 'paid'"#
        );
    }
}

#[test]
fn test_null_and_undefined() {
    assert_eq!(compiled("NEW.a === null"), r#"NEW."a" IS NULL"#);
    assert_eq!(compiled("NEW.a !== undefined"), r#"NEW."a" IS NOT NULL"#);
    assert_eq!(compiled("null != OLD.a"), r#"OLD."a" IS NOT NULL"#);
}

#[test]
fn test_connectives_and_grouping() {
    assert_eq!(
        compiled("(NEW, OLD) => (NEW.a > 1 || NEW.b < -2) && !(OLD.c === true)"),
        r#"(NEW."a" > 1 OR NEW."b" < -2) AND NOT (OLD."c" = TRUE)"#
    );
}

#[test]
fn test_renamed_parameters() {
    assert_eq!(
        parse_predicate("(after, before) => after.total > before.total").unwrap(),
        new_field("total").gt(old_field("total"))
    );
    assert_eq!(
        parse_predicate("row => row.active").unwrap(),
        new_field("active").is_true()
    );
}

#[test]
fn test_function_forms() {
    let expected = new_field("status").ne(old_field("status"));
    assert_eq!(
        parse_predicate("function (NEW, OLD) { return NEW.status !== OLD.status; }").unwrap(),
        expected
    );
    assert_eq!(
        parse_predicate("(NEW, OLD) => { return NEW.status !== OLD.status }").unwrap(),
        expected
    );
}

#[test]
fn test_bracket_access_and_methods() {
    assert_eq!(
        compiled(r#"NEW['first name'].startsWith("Dr. ")"#),
        r#"NEW."first name" LIKE ('Dr. ' || '%')"#
    );
    assert_eq!(
        compiled("NEW.email.endsWith('@corp.io')"),
        r#"NEW."email" LIKE ('%' || '@corp.io')"#
    );
    assert_eq!(
        compiled("NEW.tags.includes('vip')"),
        r#"NEW."tags" LIKE ('%' || 'vip' || '%')"#
    );
}

#[test]
fn test_literal_content_is_not_rewritten() {
    assert_eq!(
        compiled("NEW.note === 'a === b && c !== null'"),
        r#"NEW."note" = 'a === b && c !== null'"#
    );
    assert_eq!(
        compiled(r#"NEW.name === "O'Brien""#),
        r#"NEW."name" = 'O''Brien'"#
    );
}

#[test]
fn test_negation_forms() {
    assert_eq!(
        parse_predicate("(NEW) => !NEW.flag").unwrap(),
        !new_field("flag").is_true()
    );
    assert_eq!(
        parse_predicate("(NEW) => !(NEW.a === 1)").unwrap(),
        !new_field("a").eq(1)
    );
    assert_eq!(
        parse_predicate("(NEW) => !!NEW.flag").unwrap(),
        !!new_field("flag").is_true()
    );
    assert_eq!(
        parse_predicate("(NEW) => !NEW.name.startsWith('Dr.')").unwrap(),
        !new_field("name").starts_with("Dr.")
    );
}

#[test]
fn test_trailing_semicolon_is_dropped() {
    assert_eq!(compiled("NEW.a === 1;"), r#"NEW."a" = 1"#);
}

#[test]
fn test_matches_builder_output() {
    let parsed = parse_predicate(
        "(NEW, OLD) => NEW.status === 'paid' && NEW.status !== OLD.status && NEW.total >= 100",
    )
    .unwrap();
    let built = Condition::all([
        new_field("status").eq("paid"),
        new_field("status").ne(old_field("status")),
        new_field("total").ge(100),
    ]);
    assert_eq!(
        compile(&parsed, RowAccess::BOTH).unwrap(),
        compile(&built, RowAccess::BOTH).unwrap()
    );
}

// ============================================================================
// Rejected Forms
// ============================================================================

#[test]
fn test_rejects_unsupported_method() {
    let msg = rejected("(NEW) => NEW.name.toLowerCase() === 'x'");
    assert!(msg.contains("toLowerCase"));
}

#[test]
fn test_rejects_third_record() {
    let msg = rejected("(NEW, OLD, ctx) => NEW.a === ctx.a");
    assert!(msg.contains("ctx"));
    rejected("(NEW, OLD) => NEW.a === other.a");
}

#[test]
fn test_rejects_non_boolean_result() {
    rejected("(NEW) => 42");
    rejected("(NEW) => 'yes'");
}

#[test]
fn test_rejects_arithmetic_and_ternary() {
    rejected("NEW.a + 1 > 2");
    rejected("NEW.a - 1 > 2");
    rejected("NEW.a ? true : false");
    rejected("NEW.a > 1 ? NEW.b : NEW.c");
}

#[test]
fn test_rejects_comparison_of_negated_value() {
    // `!` binds tighter than `===`, so this compares `!NEW.a` with 1
    assert!(rejected("(NEW) => !NEW.a === 1").contains("negated value"));
    rejected("(NEW) => !(NEW.a) === 1");
    rejected("(NEW) => !!NEW.a !== 1");
    rejected("(NEW) => NEW.b && !NEW.a < 2");
}

#[test]
fn test_rejects_out_of_range_integers() {
    assert!(rejected("NEW.a === 99999999999999999999").contains("out of range"));
    assert_eq!(
        compiled("NEW.a > -9223372036854775808"),
        r#"NEW."a" > -9223372036854775808"#
    );
}

#[test]
fn test_rejects_template_literals_and_nesting() {
    rejected("NEW.a === `x`");
    rejected("NEW.meta.kind === 'x'");
    rejected("NEW[key] === 1");
    rejected("NEW.a.includes(OLD.a)");
}

#[test]
fn test_rejects_malformed_source() {
    rejected("");
    rejected("NEW.a === 'unterminated");
    rejected("(NEW.a === 1");
    rejected("NEW.a === 1 NEW.b === 2");
    rejected("NEW === 1");
}
