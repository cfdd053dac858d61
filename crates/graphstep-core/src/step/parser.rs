//! Exchange-structure parser built from nom combinators.
//!
//! Produces the raw header records and the flat instance table; structural
//! interpretation happens in [`super::structure`]. Combinator failures are
//! turned into [`StepError::Syntax`] with the 1-based line of the offending
//! input.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while},
    character::complete::{char, digit0, digit1, multispace1, one_of, satisfy},
    combinator::{cut, map, map_res, opt, recognize, value, verify},
    error::{context, ContextError, ErrorKind, ParseError, VerboseError, VerboseErrorKind},
    multi::{many0, many0_count, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::entity::{Entity, EntityBody, EntityId, EntityTable, Record, Value};
use super::error::{Result, StepError};

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Raw content of an exchange file.
#[derive(Debug, Clone, Default)]
pub struct ExchangeFile {
    pub header: Vec<Record>,
    pub data: EntityTable,
}

/// Parse exchange-structure text into header records and instances.
pub fn parse_exchange(input: &str) -> Result<ExchangeFile> {
    let mut cursor = Cursor::new(input);

    cursor.run(terminated(section("ISO-10303-21", "expected ISO-10303-21"), end))?;
    cursor.run(terminated(section("HEADER", "expected HEADER"), end))?;
    let header = cursor.run(many0(terminated(record, end)))?;
    cursor.run(terminated(section("ENDSEC", "expected ENDSEC"), end))?;

    let mut data = EntityTable::new();
    while cursor.run(opt(section("DATA", "expected DATA")))?.is_some() {
        // DATA('name', (schemas));
        cursor.run(terminated(opt(parameter_list), end))?;
        while cursor.run(opt(section("ENDSEC", "expected ENDSEC")))?.is_none() {
            cursor.instance_into(&mut data)?;
        }
        cursor.run(end)?;
    }

    cursor.run(terminated(section("END-ISO-10303-21", "expected END-ISO-10303-21"), end))?;
    let line = cursor.skip_trivia()?;
    if !cursor.rest.is_empty() {
        return Err(StepError::Syntax {
            line,
            message: "content after END-ISO-10303-21".into(),
        });
    }

    Ok(ExchangeFile { header, data })
}

/// Parse a bare sequence of `#n=...;` instances (no header or section framing).
pub fn parse_instances(input: &str) -> Result<EntityTable> {
    let mut cursor = Cursor::new(input);
    let mut table = EntityTable::new();
    cursor.skip_trivia()?;
    while !cursor.rest.is_empty() {
        cursor.instance_into(&mut table)?;
        cursor.skip_trivia()?;
    }
    Ok(table)
}

// ============================================================================
// Driver
// ============================================================================

/// Position in the source between top-level parser calls.
struct Cursor<'a> {
    source: &'a str,
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self { source, rest: source }
    }

    fn run<T>(&mut self, mut parser: impl FnMut(&'a str) -> Res<'a, T>) -> Result<T> {
        match parser(self.rest) {
            Ok((rest, value)) => {
                self.rest = rest;
                Ok(value)
            }
            Err(nom::Err::Error(error)) | Err(nom::Err::Failure(error)) => Err(self.syntax_error(error)),
            Err(nom::Err::Incomplete(_)) => Err(StepError::Syntax {
                line: self.line_at(""),
                message: "unexpected end of file".into(),
            }),
        }
    }

    /// Skip whitespace and comments; returns the line of the next token.
    fn skip_trivia(&mut self) -> Result<usize> {
        self.run(trivia)?;
        Ok(self.line_at(self.rest))
    }

    fn instance_into(&mut self, table: &mut EntityTable) -> Result<()> {
        let line = self.skip_trivia()?;
        let entity = self.run(instance)?;
        let id = entity.id;
        if matches!(&entity.body, EntityBody::Complex(records) if records.is_empty()) {
            return Err(StepError::Syntax {
                line,
                message: format!("empty complex instance {id}"),
            });
        }
        if table.insert(entity).is_some() {
            return Err(StepError::Syntax {
                line,
                message: format!("duplicate instance name {id}"),
            });
        }
        Ok(())
    }

    /// 1-based line of the start of `rest`, which must be a suffix of the source.
    fn line_at(&self, rest: &str) -> usize {
        let consumed = self.source.len().saturating_sub(rest.len());
        self.source.as_bytes()[..consumed].iter().filter(|&&b| b == b'\n').count() + 1
    }

    fn syntax_error(&self, error: VerboseError<&'a str>) -> StepError {
        // Innermost entry locates the failure; the first context names it.
        let rest = error.errors.first().map(|(rest, _)| *rest).unwrap_or(self.rest);
        let expected = error
            .errors
            .iter()
            .find_map(|(_, kind)| match kind {
                VerboseErrorKind::Context(message) => Some((*message).to_string()),
                _ => None,
            })
            .or_else(|| match error.errors.first() {
                Some((_, VerboseErrorKind::Char(c))) => Some(format!("expected '{c}'")),
                _ => None,
            });
        let found = rest.split_whitespace().next().map(|word| word.chars().take(16).collect::<String>());

        let message = match (expected, found) {
            (Some(expected), Some(found)) => format!("{expected} near '{found}'"),
            (Some(expected), None) => format!("{expected} at end of file"),
            (None, Some(found)) => format!("unexpected '{found}'"),
            (None, None) => "unexpected end of file".into(),
        };
        StepError::Syntax {
            line: self.line_at(rest),
            message,
        }
    }
}

// ============================================================================
// Combinators
// ============================================================================

fn comment(input: &str) -> Res<'_, &str> {
    recognize(preceded(
        tag("/*"),
        cut(context("unterminated comment", pair(take_until("*/"), tag("*/")))),
    ))(input)
}

fn trivia(input: &str) -> Res<'_, ()> {
    value((), many0_count(alt((multispace1, comment))))(input)
}

fn sym<'a>(c: char) -> impl FnMut(&'a str) -> Res<'a, char> {
    preceded(trivia, char(c))
}

fn end(input: &str) -> Res<'_, char> {
    cut(context("expected ';'", sym(';')))(input)
}

/// `PRODUCT`, `!USER_KEYWORD`, `END-ISO-10303-21`
fn keyword_text(input: &str) -> Res<'_, &str> {
    recognize(tuple((
        opt(char('!')),
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
    )))(input)
}

fn keyword(input: &str) -> Res<'_, String> {
    map(preceded(trivia, keyword_text), str::to_ascii_uppercase)(input)
}

fn section<'a>(word: &'static str, expected: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    context(
        expected,
        preceded(trivia, verify(keyword_text, move |k: &str| k.eq_ignore_ascii_case(word))),
    )
}

fn instance_name(input: &str) -> Res<'_, EntityId> {
    preceded(
        char('#'),
        cut(context(
            "expected instance number",
            map_res(digit1, |digits: &str| digits.parse::<u64>().map(EntityId)),
        )),
    )(input)
}

/// `'text'` with `''` for an apostrophe. Line breaks inside are not significant.
fn string_literal(input: &str) -> Res<'_, String> {
    let (body, _) = char::<_, VerboseError<&str>>('\'')(input)?;
    let mut out = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' if matches!(chars.peek(), Some((_, '\''))) => {
                chars.next();
                out.push('\'');
            }
            '\'' => return Ok((&body[i + 1..], out)),
            '\n' | '\r' => {}
            c => out.push(c),
        }
    }
    Err(nom::Err::Failure(VerboseError::add_context(
        input,
        "unterminated string",
        VerboseError::from_error_kind(input, ErrorKind::Char),
    )))
}

fn enumeration(input: &str) -> Res<'_, String> {
    map(
        delimited(
            char('.'),
            recognize(pair(
                satisfy(|c| c.is_ascii_alphanumeric() || c == '_'),
                take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            )),
            cut(context("expected '.' closing enumeration", char('.'))),
        ),
        String::from,
    )(input)
}

fn binary(input: &str) -> Res<'_, String> {
    map(
        delimited(
            char('"'),
            take_while(|c: char| c.is_ascii_hexdigit()),
            cut(context("unterminated binary literal", char('"'))),
        ),
        String::from,
    )(input)
}

/// Integers, and reals in any of the spellings `1.`, `1.5`, `1.E-07`.
fn number(input: &str) -> Res<'_, Value> {
    map_res(
        recognize(tuple((
            opt(one_of("+-")),
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |text: &str| {
            if text.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
                match text.parse::<f64>() {
                    Ok(real) if real.is_finite() => Ok(Value::Real(real)),
                    _ => Err(()),
                }
            } else {
                text.parse().map(Value::Integer).map_err(|_| ())
            }
        },
    )(input)
}

/// `LENGTH_MEASURE(1.E-07)`
fn typed(input: &str) -> Res<'_, Value> {
    map(
        pair(
            keyword,
            delimited(sym('('), parameter, cut(context("expected ')'", sym(')')))),
        ),
        |(keyword, value)| Value::Typed {
            keyword,
            value: Box::new(value),
        },
    )(input)
}

fn parameter(input: &str) -> Res<'_, Value> {
    preceded(
        trivia,
        alt((
            value(Value::Unset, char('$')),
            value(Value::Derived, char('*')),
            map(instance_name, Value::Reference),
            map(enumeration, Value::Enumeration),
            map(string_literal, Value::String),
            map(binary, Value::Binary),
            number,
            map(parameter_list, Value::List),
            typed,
        )),
    )(input)
}

fn parameter_list(input: &str) -> Res<'_, Vec<Value>> {
    delimited(
        sym('('),
        separated_list0(sym(','), parameter),
        cut(context("expected ',' or ')'", sym(')'))),
    )(input)
}

fn record(input: &str) -> Res<'_, Record> {
    map(pair(keyword, parameter_list), |(keyword, params)| Record { keyword, params })(input)
}

/// `( LENGTH_UNIT() NAMED_UNIT(*) SI_UNIT(.MILLI.,.METRE.) )`
fn complex_body(input: &str) -> Res<'_, Vec<Record>> {
    delimited(sym('('), many0(record), cut(context("expected ')'", sym(')'))))(input)
}

fn instance(input: &str) -> Res<'_, Entity> {
    let (input, id) = context("expected instance name", preceded(trivia, instance_name))(input)?;
    let (input, _) = cut(context("expected '='", sym('=')))(input)?;
    let (input, body) = cut(context(
        "expected entity",
        alt((map(complex_body, EntityBody::Complex), map(record, EntityBody::Simple))),
    ))(input)?;
    let (input, _) = end(input)?;
    Ok((input, Entity { id, body }))
}
