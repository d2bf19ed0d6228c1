//! Search filter model and parsers.
//!
//! A filter is a tree of boolean predicates over entry attributes. It has
//! two wire-adjacent surface forms: the RFC 4515 string representation,
//! produced by [`Filter::parse`] and [`fmt::Display`], and the RFC 4511
//! BER form, produced by [`Filter::into_tag`] and [`Filter::from_tag`].
//! [`Filter::matches`] evaluates the tree against an already-parsed entry.

use std::fmt;

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::digit1;
use nom::character::{is_alphabetic, is_alphanumeric, is_hex_digit};
use nom::combinator::{map, map_res, opt, recognize, verify};
use nom::multi::{fold_many0, many0};
use nom::number::complete::be_u8;
use nom::sequence::{delimited, preceded};
use nom::IResult;

use crate::result::{LdapError, Result};
use crate::search::SearchEntry;

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;
const EXT_MATCH: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

/// A search filter node.
///
/// Assertion values are byte vectors: the string parser passes UTF-8
/// through and turns `\NN` hex escapes into raw bytes, so a value needn't
/// be valid UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Every subfilter must match. An empty list is the absolute true
    /// filter of RFC 4526.
    And(Vec<Filter>),
    /// At least one subfilter must match. An empty list is the absolute
    /// false filter of RFC 4526.
    Or(Vec<Filter>),
    /// The subfilter must not match.
    Not(Box<Filter>),
    /// Attribute has exactly this value.
    Equality { attr: String, value: Vec<u8> },
    /// Attribute value matches the `initial*any*...*last` pattern.
    Substring {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    /// Attribute has a value ordered at or above the assertion value.
    GreaterOrEqual { attr: String, value: Vec<u8> },
    /// Attribute has a value ordered at or below the assertion value.
    LessOrEqual { attr: String, value: Vec<u8> },
    /// Attribute is present, with any value.
    Present { attr: String },
    /// Approximate match; evaluation is left to the server.
    Approx { attr: String, value: Vec<u8> },
    /// Extensible match with an optional matching rule.
    Extensible {
        rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Parse the RFC 4515 string form. A bare expression without the
    /// outer parentheses is accepted and wrapped automatically.
    pub fn parse(input: &str) -> Result<Filter> {
        let wrapped;
        let input = if input.starts_with('(') {
            input
        } else {
            wrapped = format!("({})", input);
            &wrapped
        };
        match filter(input.as_bytes()) {
            Ok((rest, f)) if rest.is_empty() => Ok(f),
            _ => Err(LdapError::FilterParsing),
        }
    }

    /// Decode the RFC 4511 BER form.
    pub fn from_tag(t: StructureTag) -> Result<Filter> {
        fn bad() -> LdapError {
            LdapError::FilterParsing
        }

        fn primitive(t: StructureTag) -> Result<Vec<u8>> {
            t.expect_primitive().ok_or_else(bad)
        }

        fn ava(t: StructureTag) -> Result<(String, Vec<u8>)> {
            let mut parts = t.expect_constructed().ok_or_else(bad)?.into_iter();
            let attr = primitive(parts.next().ok_or_else(bad)?)?;
            let value = primitive(parts.next().ok_or_else(bad)?)?;
            Ok((String::from_utf8(attr).map_err(|_| bad())?, value))
        }

        if t.class != TagClass::Context {
            return Err(LdapError::UnknownFilterTag(t.id));
        }
        let id = t.id;
        Ok(match id {
            AND_FILT | OR_FILT => {
                let children = t
                    .expect_constructed()
                    .ok_or_else(bad)?
                    .into_iter()
                    .map(Filter::from_tag)
                    .collect::<Result<Vec<_>>>()?;
                if id == AND_FILT {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                }
            }
            NOT_FILT => {
                let mut inner = t.expect_constructed().ok_or_else(bad)?;
                if inner.len() != 1 {
                    return Err(bad());
                }
                Filter::Not(Box::new(Filter::from_tag(inner.pop().expect("child"))?))
            }
            EQ_MATCH | GTE_MATCH | LTE_MATCH | APPROX_MATCH => {
                let (attr, value) = ava(t)?;
                match id {
                    EQ_MATCH => Filter::Equality { attr, value },
                    GTE_MATCH => Filter::GreaterOrEqual { attr, value },
                    LTE_MATCH => Filter::LessOrEqual { attr, value },
                    _ => Filter::Approx { attr, value },
                }
            }
            SUBSTR_MATCH => {
                let mut parts = t.expect_constructed().ok_or_else(bad)?.into_iter();
                let attr = String::from_utf8(primitive(parts.next().ok_or_else(bad)?)?)
                    .map_err(|_| bad())?;
                let subs = parts.next().ok_or_else(bad)?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut last = None;
                for sub in subs.expect_constructed().ok_or_else(bad)? {
                    let id = sub.id;
                    let v = primitive(sub)?;
                    match id {
                        SUB_INITIAL => initial = Some(v),
                        SUB_ANY => any.push(v),
                        SUB_FINAL => last = Some(v),
                        other => return Err(LdapError::UnknownFilterTag(other)),
                    }
                }
                Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                }
            }
            PRES_MATCH => Filter::Present {
                attr: String::from_utf8(primitive(t)?).map_err(|_| bad())?,
            },
            EXT_MATCH => {
                let mut rule = None;
                let mut attr = None;
                let mut value = Vec::new();
                let mut dn_attributes = false;
                for part in t.expect_constructed().ok_or_else(bad)? {
                    match part {
                        StructureTag {
                            id: 1,
                            payload: PL::P(v),
                            ..
                        } => rule = Some(String::from_utf8(v).map_err(|_| bad())?),
                        StructureTag {
                            id: 2,
                            payload: PL::P(v),
                            ..
                        } => attr = Some(String::from_utf8(v).map_err(|_| bad())?),
                        StructureTag {
                            id: 3,
                            payload: PL::P(v),
                            ..
                        } => value = v,
                        StructureTag {
                            id: 4,
                            payload: PL::P(v),
                            ..
                        } => dn_attributes = v.first().copied().unwrap_or(0) != 0,
                        _ => return Err(bad()),
                    }
                }
                Filter::Extensible {
                    rule,
                    attr,
                    value,
                    dn_attributes,
                }
            }
            other => return Err(LdapError::UnknownFilterTag(other)),
        })
    }

    /// Encode into the RFC 4511 BER form.
    pub fn into_tag(self) -> Tag {
        fn octets(inner: Vec<u8>) -> Tag {
            Tag::OctetString(OctetString {
                inner,
                ..Default::default()
            })
        }

        fn set(id: u64, children: Vec<Filter>) -> Tag {
            Tag::Sequence(Sequence {
                class: TagClass::Context,
                id,
                inner: children.into_iter().map(Filter::into_tag).collect(),
            })
        }

        fn ava(id: u64, attr: String, value: Vec<u8>) -> Tag {
            Tag::Sequence(Sequence {
                class: TagClass::Context,
                id,
                inner: vec![octets(attr.into_bytes()), octets(value)],
            })
        }

        match self {
            Filter::And(children) => set(AND_FILT, children),
            Filter::Or(children) => set(OR_FILT, children),
            Filter::Not(inner) => Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: NOT_FILT,
                inner: Box::new(inner.into_tag()),
            }),
            Filter::Equality { attr, value } => ava(EQ_MATCH, attr, value),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                let mut subs = vec![];
                if let Some(initial) = initial {
                    subs.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: SUB_INITIAL,
                        inner: initial,
                    }));
                }
                for sub in any {
                    subs.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: SUB_ANY,
                        inner: sub,
                    }));
                }
                if let Some(last) = last {
                    subs.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: SUB_FINAL,
                        inner: last,
                    }));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: SUBSTR_MATCH,
                    inner: vec![
                        octets(attr.into_bytes()),
                        Tag::Sequence(Sequence {
                            inner: subs,
                            ..Default::default()
                        }),
                    ],
                })
            }
            Filter::GreaterOrEqual { attr, value } => ava(GTE_MATCH, attr, value),
            Filter::LessOrEqual { attr, value } => ava(LTE_MATCH, attr, value),
            Filter::Present { attr } => Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: PRES_MATCH,
                inner: attr.into_bytes(),
            }),
            Filter::Approx { attr, value } => ava(APPROX_MATCH, attr, value),
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                let mut inner = vec![];
                if let Some(rule) = rule {
                    inner.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: 1,
                        inner: rule.into_bytes(),
                    }));
                }
                if let Some(attr) = attr {
                    inner.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: 2,
                        inner: attr.into_bytes(),
                    }));
                }
                inner.push(Tag::OctetString(OctetString {
                    class: TagClass::Context,
                    id: 3,
                    inner: value,
                }));
                if dn_attributes {
                    inner.push(Tag::Boolean(Boolean {
                        class: TagClass::Context,
                        id: 4,
                        inner: dn_attributes,
                    }));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: EXT_MATCH,
                    inner,
                })
            }
        }
    }

    /// Evaluate this filter against an entry.
    ///
    /// With `case_sensitive` false, equality and substring comparisons
    /// fold ASCII case on both sides. Approximate and extensible matches
    /// always evaluate to false locally, since their matching rules live
    /// on the server.
    pub fn matches(&self, entry: &SearchEntry, case_sensitive: bool) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(entry, case_sensitive)),
            Filter::Or(children) => children.iter().any(|f| f.matches(entry, case_sensitive)),
            Filter::Not(inner) => !inner.matches(entry, case_sensitive),
            Filter::Equality { attr, value } => values_of(entry, attr)
                .iter()
                .any(|v| bytes_eq(v, value, case_sensitive)),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => values_of(entry, attr).iter().any(|v| {
                substring_match(v, initial.as_deref(), any, last.as_deref(), case_sensitive)
            }),
            Filter::GreaterOrEqual { attr, value } => values_of(entry, attr)
                .iter()
                .any(|v| v.as_slice() >= value.as_slice()),
            Filter::LessOrEqual { attr, value } => values_of(entry, attr)
                .iter()
                .any(|v| v.as_slice() <= value.as_slice()),
            Filter::Present { attr } => !values_of(entry, attr).is_empty(),
            Filter::Approx { .. } | Filter::Extensible { .. } => false,
        }
    }
}

fn values_of(entry: &SearchEntry, attr: &str) -> Vec<Vec<u8>> {
    let mut vals = Vec::new();
    for (name, values) in &entry.attrs {
        if name.eq_ignore_ascii_case(attr) {
            vals.extend(values.iter().map(|v| v.as_bytes().to_vec()));
        }
    }
    for (name, values) in &entry.bin_attrs {
        if name.eq_ignore_ascii_case(attr) {
            vals.extend(values.iter().cloned());
        }
    }
    vals
}

fn bytes_eq(a: &[u8], b: &[u8], case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

fn find_from(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from);
    }
    if hay.len() < from + needle.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| &hay[i..i + needle.len()] == needle)
}

fn substring_match(
    value: &[u8],
    initial: Option<&[u8]>,
    any: &[Vec<u8>],
    last: Option<&[u8]>,
    case_sensitive: bool,
) -> bool {
    let folded_value;
    let folded_initial;
    let folded_any;
    let folded_last;
    let (value, initial, any, last): (&[u8], Option<&[u8]>, &[Vec<u8>], Option<&[u8]>) =
        if case_sensitive {
            (value, initial, any, last)
        } else {
            folded_value = value.to_ascii_lowercase();
            folded_initial = initial.map(<[u8]>::to_ascii_lowercase);
            folded_any = any
                .iter()
                .map(|v| v.to_ascii_lowercase())
                .collect::<Vec<_>>();
            folded_last = last.map(<[u8]>::to_ascii_lowercase);
            (
                &folded_value,
                folded_initial.as_deref(),
                &folded_any,
                folded_last.as_deref(),
            )
        };
    let mut pos = 0;
    if let Some(initial) = initial {
        if !value.starts_with(initial) {
            return false;
        }
        pos = initial.len();
    }
    for sub in any {
        match find_from(value, sub, pos) {
            Some(at) => pos = at + sub.len(),
            None => return false,
        }
    }
    if let Some(last) = last {
        value.len() >= pos + last.len() && value.ends_with(last)
    } else {
        true
    }
}

fn write_value(f: &mut fmt::Formatter, value: &[u8]) -> fmt::Result {
    for &c in value {
        if c == b'\\' || c == b'*' || c == b'(' || c == b')' || c == 0 || c < 0x20 || c >= 0x7f {
            write!(f, "\\{:02x}", c)?;
        } else {
            write!(f, "{}", c as char)?;
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for c in children {
                    c.fmt(f)?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for c in children {
                    c.fmt(f)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attr, value } => {
                write!(f, "({}=", attr)?;
                write_value(f, value)?;
                f.write_str(")")
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    write_value(f, initial)?;
                }
                for sub in any {
                    f.write_str("*")?;
                    write_value(f, sub)?;
                }
                f.write_str("*")?;
                if let Some(last) = last {
                    write_value(f, last)?;
                }
                f.write_str(")")
            }
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({}>=", attr)?;
                write_value(f, value)?;
                f.write_str(")")
            }
            Filter::LessOrEqual { attr, value } => {
                write!(f, "({}<=", attr)?;
                write_value(f, value)?;
                f.write_str(")")
            }
            Filter::Present { attr } => write!(f, "({}=*)", attr),
            Filter::Approx { attr, value } => {
                write!(f, "({}~=", attr)?;
                write_value(f, value)?;
                f.write_str(")")
            }
            Filter::Extensible {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(attr) = attr {
                    f.write_str(attr)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                f.write_str(":=")?;
                write_value(f, value)?;
                f.write_str(")")
            }
        }
    }
}

fn filter(i: &[u8]) -> IResult<&[u8], Filter> {
    delimited(tag(b"("), filtercomp, tag(b")"))(i)
}

fn filtercomp(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((and, or, not, item))(i)
}

fn filterlist(i: &[u8]) -> IResult<&[u8], Vec<Filter>> {
    many0(filter)(i)
}

fn and(i: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(tag(b"&"), filterlist), Filter::And)(i)
}

fn or(i: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(tag(b"|"), filterlist), Filter::Or)(i)
}

fn not(i: &[u8]) -> IResult<&[u8], Filter> {
    map(preceded(tag(b"!"), filter), |f| Filter::Not(Box::new(f)))(i)
}

fn item(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((eq, non_eq, extensible))(i)
}

pub(crate) enum Unescaper {
    WantFirst,
    WantSecond(u8),
    Value(u8),
    Error,
}

impl Unescaper {
    pub(crate) fn feed(&self, c: u8) -> Unescaper {
        match *self {
            Unescaper::Error => Unescaper::Error,
            Unescaper::WantFirst => {
                if is_hex_digit(c) {
                    Unescaper::WantSecond(c - if c <= b'9' { b'0' } else { (c & 0x20) + b'A' - 10 })
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::WantSecond(partial) => {
                if is_hex_digit(c) {
                    Unescaper::Value(
                        (partial << 4)
                            + (c - if c <= b'9' {
                                b'0'
                            } else {
                                (c & 0x20) + b'A' - 10
                            }),
                    )
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::Value(_v) => {
                if c != b'\\' {
                    Unescaper::Value(c)
                } else {
                    Unescaper::WantFirst
                }
            }
        }
    }
}

// Any byte in the assertion value may be represented by \NN, where N is a hex digit.
// Some characters must be represented in this way: parentheses, asterisk and backslash
// itself.
fn unescaped(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(
        fold_many0(
            verify(be_u8, is_value_char),
            || (Unescaper::Value(0), Vec::new()),
            |(mut u, mut vec): (Unescaper, Vec<_>), c: u8| {
                u = u.feed(c);
                if let Unescaper::Value(c) = u {
                    vec.push(c);
                }
                (u, vec)
            },
        ),
        |(u, vec): (Unescaper, Vec<_>)| -> std::result::Result<Vec<u8>, ()> {
            if let Unescaper::Value(_) = u {
                Ok(vec)
            } else {
                Err(())
            }
        },
    )(i)
}

fn is_value_char(&c: &u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

fn non_eq(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, filterop) = alt((tag(b">="), tag(b"<="), tag("~=")))(i)?;
    let (i, value) = unescaped(i)?;
    let attr = String::from_utf8_lossy(attr).into_owned();
    let filter = match filterop {
        b">=" => Filter::GreaterOrEqual { attr, value },
        b"<=" => Filter::LessOrEqual { attr, value },
        _ => Filter::Approx { attr, value },
    };
    Ok((i, filter))
}

fn eq(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, _) = tag(b"=")(i)?;
    let (i, initial) = unescaped(i)?;
    let (i, mid_final) = map_res(
        many0(preceded(tag(b"*"), unescaped)),
        |v: Vec<Vec<u8>>| -> std::result::Result<Vec<Vec<u8>>, ()> {
            if v.iter().enumerate().fold(false, |acc, (n, ve)| {
                acc || ve.is_empty() && n + 1 != v.len()
            }) {
                Err(())
            } else {
                Ok(v)
            }
        },
    )(i)?;
    let attr = String::from_utf8_lossy(attr).into_owned();
    let filter = if mid_final.is_empty() {
        // simple equality, no asterisks in assertion value
        Filter::Equality {
            attr,
            value: initial,
        }
    } else if initial.is_empty() && mid_final.len() == 1 && mid_final[0].is_empty() {
        // presence, single asterisk in assertion value
        Filter::Present { attr }
    } else {
        // substring match
        let mut any = vec![];
        let mut last = None;
        let n = mid_final.len();
        for (i, sub_elem) in mid_final.into_iter().enumerate() {
            if sub_elem.is_empty() {
                break;
            }
            if i + 1 != n {
                any.push(sub_elem);
            } else {
                last = Some(sub_elem);
            }
        }
        Filter::Substring {
            attr,
            initial: if initial.is_empty() {
                None
            } else {
                Some(initial)
            },
            any,
            last,
        }
    };
    Ok((i, filter))
}

fn extensible(i: &[u8]) -> IResult<&[u8], Filter> {
    alt((attr_dn_mrule, dn_mrule))(i)
}

fn attr_dn_mrule(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, attr) = attributedescription(i)?;
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = opt(preceded(tag(b":"), attributetype))(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((i, extensible_filter(mrule, Some(attr), value, dn.is_some())))
}

fn dn_mrule(i: &[u8]) -> IResult<&[u8], Filter> {
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = preceded(tag(b":"), attributetype)(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((i, extensible_filter(Some(mrule), None, value, dn.is_some())))
}

fn extensible_filter(
    mrule: Option<&[u8]>,
    attr: Option<&[u8]>,
    value: Vec<u8>,
    dn: bool,
) -> Filter {
    Filter::Extensible {
        rule: mrule.map(|r| String::from_utf8_lossy(r).into_owned()),
        attr: attr.map(|a| String::from_utf8_lossy(a).into_owned()),
        value,
        dn_attributes: dn,
    }
}

fn attributedescription(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = attributetype(i)?;
        let (i, _) = many0(preceded(tag(b";"), take_while1(is_alnum_hyphen)))(i)?;
        Ok((i, ()))
    })(i)
}

fn is_alnum_hyphen(c: u8) -> bool {
    is_alphanumeric(c) || c == b'-'
}

fn attributetype(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numericoid, descr))(i)
}

fn numericoid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = number(i)?;
        let (i, _) = many0(preceded(tag(b"."), number))(i)?;
        Ok((i, ()))
    })(i)
}

// A number may be zero, but must not have superfluous leading zeroes
fn number(i: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0')(i)
}

fn descr(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = verify(be_u8, |c| is_alphabetic(*c))(i)?;
        let (i, _) = take_while(is_alnum_hyphen)(i)?;
        Ok((i, ()))
    })(i)
}

#[cfg(test)]
mod test {
    use super::Filter;
    use crate::search::SearchEntry;
    use std::collections::HashMap;

    fn ber_vec_eq(filter: &str, ber: &[u8]) {
        use bytes::BytesMut;
        use lber::structures::ASNTag;
        use lber::write;

        let mut buf = BytesMut::new();
        let tag = Filter::parse(filter).unwrap().into_tag();
        write::encode_into(&mut buf, tag.into_structure()).unwrap();
        assert_eq!(buf, ber);
    }

    fn binary_roundtrip(filter: &str) {
        use bytes::BytesMut;
        use lber::parse::parse_tag;
        use lber::structures::ASNTag;
        use lber::write;

        let parsed = Filter::parse(filter).unwrap();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, parsed.clone().into_tag().into_structure()).unwrap();
        let (rest, tag) = parse_tag(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(Filter::from_tag(tag).unwrap(), parsed);
    }

    fn text_roundtrip(filter: &str) {
        let parsed = Filter::parse(filter).unwrap();
        assert_eq!(parsed.to_string(), filter);
        assert_eq!(Filter::parse(&parsed.to_string()).unwrap(), parsed);
    }

    fn entry(attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: "cn=test".to_string(),
            attrs: attrs
                .iter()
                .map(|(n, vs)| (n.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn filt_bare_item() {
        ber_vec_eq("a=v", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_simple_eq() {
        ber_vec_eq("(a=v)", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_extra_garbage() {
        assert!(Filter::parse("(a=v)garbage").is_err());
    }

    #[test]
    fn filt_simple_noneq() {
        ber_vec_eq("(a<=2)", b"\xa6\x06\x04\x01a\x04\x012");
    }

    #[test]
    fn filt_pres() {
        ber_vec_eq("(a=*)", b"\x87\x01a");
    }

    #[test]
    fn filt_ast_ini() {
        ber_vec_eq("(a=*v)", b"\xa4\x08\x04\x01a0\x03\x82\x01v");
    }

    #[test]
    fn filt_ast_fin() {
        ber_vec_eq("(a=v*)", b"\xa4\x08\x04\x01a0\x03\x80\x01v");
    }

    #[test]
    fn filt_ast_multi() {
        ber_vec_eq(
            "(a=v*x*y)",
            b"\xa4\x0e\x04\x01a0\t\x80\x01v\x81\x01x\x82\x01y",
        );
    }

    #[test]
    fn filt_ast_double() {
        assert!(Filter::parse("(a=f**)").is_err());
    }

    #[test]
    fn filt_esc_ok() {
        ber_vec_eq("(a=v\\2ax)", b"\xa3\x08\x04\x01a\x04\x03v*x");
    }

    #[test]
    fn filt_esc_runt() {
        assert!(Filter::parse("(a=v\\2)").is_err());
    }

    #[test]
    fn filt_esc_invalid() {
        assert!(Filter::parse("(a=v\\0x)").is_err());
    }

    #[test]
    fn filt_oid() {
        ber_vec_eq("(2.5.4.3=v)", b"\xa3\x0c\x04\x072.5.4.3\x04\x01v");
    }

    #[test]
    fn filt_oidl0() {
        assert!(Filter::parse("(2.5.04.0=top)").is_err());
    }

    #[test]
    fn filt_complex() {
        ber_vec_eq("(&(a=v)(b=x)(!(c=y)))", b"\xa0\x1a\xa3\x06\x04\x01a\x04\x01v\xa3\x06\x04\x01b\x04\x01x\xa2\x08\xa3\x06\x04\x01c\x04\x01y");
    }

    #[test]
    fn filt_abs_true() {
        ber_vec_eq("(&)", b"\xa0\0");
    }

    #[test]
    fn filt_abs_false() {
        ber_vec_eq("(|)", b"\xa1\0");
    }

    #[test]
    fn filt_ext_dn() {
        ber_vec_eq(
            "(ou:dn:=People)",
            b"\xa9\x0f\x82\x02ou\x83\x06People\x84\x01\xff",
        );
    }

    #[test]
    fn filt_ext_mrule() {
        ber_vec_eq(
            "(cn:2.5.13.5:=J D)",
            b"\xa9\x13\x81\x082.5.13.5\x82\x02cn\x83\x03J D",
        );
    }

    #[test]
    fn filt_simple_utf8() {
        ber_vec_eq("(a=ć)", b"\xa3\x07\x04\x01a\x04\x02\xc4\x87");
    }

    #[test]
    fn filt_structure() {
        let f = Filter::parse("(&(cn=Jim*)(!(uid=2)))").unwrap();
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::Substring {
                    attr: "cn".to_string(),
                    initial: Some(b"Jim".to_vec()),
                    any: vec![],
                    last: None,
                },
                Filter::Not(Box::new(Filter::Equality {
                    attr: "uid".to_string(),
                    value: b"2".to_vec(),
                })),
            ])
        );
        assert_eq!(f.to_string(), "(&(cn=Jim*)(!(uid=2)))");
    }

    #[test]
    fn filt_text_roundtrips() {
        text_roundtrip("(objectClass=*)");
        text_roundtrip("(&(a=v)(b>=2)(c<=3)(d~=x))");
        text_roundtrip("(|(cn=a*b*c)(!(sn=x)))");
        text_roundtrip("(cn:2.5.13.5:=J D)");
        text_roundtrip("(a=v\\2ax)");
    }

    #[test]
    fn filt_binary_roundtrips() {
        binary_roundtrip("(a=v)");
        binary_roundtrip("(&(a=v)(b=x)(!(c=y)))");
        binary_roundtrip("(a=v*x*y)");
        binary_roundtrip("(a=*)");
        binary_roundtrip("(ou:dn:=People)");
        binary_roundtrip("(&)");
        binary_roundtrip("(|)");
    }

    #[test]
    fn filt_unknown_tag() {
        use lber::common::TagClass;
        use lber::structure::{StructureTag, PL};

        let t = StructureTag {
            class: TagClass::Context,
            id: 12,
            payload: PL::P(vec![]),
        };
        assert!(Filter::from_tag(t).is_err());
    }

    #[test]
    fn match_eq_and_case() {
        let e = entry(&[("cn", &["Jim Beam"]), ("uid", &["2"])]);
        assert!(Filter::parse("(cn=Jim Beam)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(cn=jim beam)").unwrap().matches(&e, true));
        assert!(Filter::parse("(cn=jim beam)").unwrap().matches(&e, false));
        assert!(Filter::parse("(CN=Jim Beam)").unwrap().matches(&e, true));
    }

    #[test]
    fn match_substring() {
        let e = entry(&[("cn", &["Jim Beam"])]);
        assert!(Filter::parse("(cn=Jim*)").unwrap().matches(&e, true));
        assert!(Filter::parse("(cn=*Beam)").unwrap().matches(&e, true));
        assert!(Filter::parse("(cn=J*m*am)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(cn=J*zz*am)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(cn=Beam*)").unwrap().matches(&e, true));
    }

    #[test]
    fn match_ordering_and_presence() {
        let e = entry(&[("uid", &["m"])]);
        assert!(Filter::parse("(uid>=a)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(uid>=z)").unwrap().matches(&e, true));
        assert!(Filter::parse("(uid<=z)").unwrap().matches(&e, true));
        assert!(Filter::parse("(uid=*)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(cn=*)").unwrap().matches(&e, true));
    }

    #[test]
    fn match_boolean_composition() {
        let e = entry(&[("cn", &["Jim"]), ("uid", &["2"])]);
        assert!(Filter::parse("(&(cn=Jim)(uid=2))").unwrap().matches(&e, true));
        assert!(!Filter::parse("(&(cn=Jim)(!(uid=2)))").unwrap().matches(&e, true));
        assert!(Filter::parse("(|(cn=Nope)(uid=2))").unwrap().matches(&e, true));
        // absolute true and false filters
        assert!(Filter::parse("(&)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(|)").unwrap().matches(&e, true));
    }

    #[test]
    fn match_server_side_variants() {
        let e = entry(&[("cn", &["Jim"])]);
        assert!(!Filter::parse("(cn~=Jim)").unwrap().matches(&e, true));
        assert!(!Filter::parse("(cn:2.5.13.5:=Jim)").unwrap().matches(&e, true));
    }
}
