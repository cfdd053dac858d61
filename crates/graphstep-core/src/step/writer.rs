//! Exchange-structure text output.

use std::fmt::Write;

use super::entity::{Entity, EntityBody, Record, Value};

/// Format a real the way exchange files spell them: `10.`, `-0.5`, `1.E-07`.
/// Callers only hold finite values: the parser, argument parsing and wire
/// placements all reject NaN and infinities.
pub fn format_real(value: f64) -> String {
    debug_assert!(value.is_finite(), "non-finite real {value} has no exchange-file spelling");
    if !value.is_finite() {
        return "0.".to_string();
    }
    let repr = format!("{value:?}");
    let (mantissa, exponent) = match repr.split_once('e') {
        Some((m, e)) => (m.to_string(), Some(e.to_string())),
        None => (repr, None),
    };

    let mut out = if let Some(stripped) = mantissa.strip_suffix(".0") {
        format!("{stripped}.")
    } else if mantissa.contains('.') {
        mantissa
    } else {
        format!("{mantissa}.")
    };

    if let Some(exp) = exponent {
        let (sign, digits) = match exp.strip_prefix('-') {
            Some(d) => ("-", d),
            None => ("", exp.as_str()),
        };
        let _ = write!(out, "E{sign}{digits:0>2}");
    }
    out
}

fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

pub fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Real(r) => out.push_str(&format_real(*r)),
        Value::String(s) => {
            out.push('\'');
            out.push_str(&escape_string(s));
            out.push('\'');
        }
        Value::Enumeration(e) => {
            let _ = write!(out, ".{e}.");
        }
        Value::Binary(b) => {
            let _ = write!(out, "\"{b}\"");
        }
        Value::Reference(id) => {
            let _ = write!(out, "{id}");
        }
        Value::List(items) => {
            out.push('(');
            write_values(out, items);
            out.push(')');
        }
        Value::Typed { keyword, value } => {
            out.push_str(keyword);
            out.push('(');
            write_value(out, value);
            out.push(')');
        }
        Value::Unset => out.push('$'),
        Value::Derived => out.push('*'),
    }
}

fn write_values(out: &mut String, values: &[Value]) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, value);
    }
}

pub fn write_record(out: &mut String, record: &Record) {
    out.push_str(&record.keyword);
    out.push('(');
    write_values(out, &record.params);
    out.push(')');
}

/// `#id=KEYWORD(...);`
pub fn write_entity(out: &mut String, entity: &Entity) {
    let _ = write!(out, "{}=", entity.id);
    match &entity.body {
        EntityBody::Simple(record) => write_record(out, record),
        EntityBody::Complex(records) => {
            out.push('(');
            for record in records {
                out.push(' ');
                write_record(out, record);
            }
            out.push_str(" )");
        }
    }
    out.push_str(";\n");
}

/// Write a complete exchange file.
pub fn write_exchange<'a>(header: &[Record], data: impl IntoIterator<Item = &'a Entity>) -> String {
    let mut out = String::from("ISO-10303-21;\nHEADER;\n");
    for record in header {
        write_record(&mut out, record);
        out.push_str(";\n");
    }
    out.push_str("ENDSEC;\nDATA;\n");
    for entity in data {
        write_entity(&mut out, entity);
    }
    out.push_str("ENDSEC;\nEND-ISO-10303-21;\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::entity::EntityId;

    #[test]
    fn test_format_real() {
        assert_eq!(format_real(10.0), "10.");
        assert_eq!(format_real(-0.5), "-0.5");
        assert_eq!(format_real(0.0), "0.");
        assert_eq!(format_real(1.0e-7), "1.E-07");
        assert_eq!(format_real(2.5e20), "2.5E20");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "non-finite real")]
    fn test_format_real_rejects_non_finite() {
        format_real(f64::NAN);
    }

    #[test]
    fn test_real_text_reparses_exactly() {
        for value in [0.1, 1.0 / 3.0, -123456.789, 1.0e-12, 6.02214076e23] {
            let text = format_real(value);
            let table = crate::step::parser::parse_instances(&format!("#1=X({text});")).unwrap();
            let record = table.record(EntityId(1), "X").unwrap();
            assert_eq!(record.params, vec![Value::Real(value)], "{text}");
        }
    }

    #[test]
    fn test_write_complex_entity() {
        let entity = Entity {
            id: EntityId(4),
            body: EntityBody::Complex(vec![
                Record::new("LENGTH_UNIT", vec![]),
                Record::new("NAMED_UNIT", vec![Value::Derived]),
                Record::new(
                    "SI_UNIT",
                    vec![Value::Enumeration("MILLI".into()), Value::Enumeration("METRE".into())],
                ),
            ]),
        };
        let mut out = String::new();
        write_entity(&mut out, &entity);
        assert_eq!(out, "#4=( LENGTH_UNIT() NAMED_UNIT(*) SI_UNIT(.MILLI.,.METRE.) );\n");
    }

    #[test]
    fn test_string_escaping() {
        let mut out = String::new();
        write_value(&mut out, &Value::String("it's".into()));
        assert_eq!(out, "'it''s'");
    }
}
