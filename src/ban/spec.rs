//! Ban spec codec.
//!
//! A ban is compiled into an immutable byte string which is also what the
//! persistence layer stores and hands back on reload:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | native-endian `f64` creation timestamp |
//! | 8 | 4 | big-endian `u32` total length, counted from offset 0 |
//! | 12 | 1 | flags: `0x01` if any test reads request data |
//! | 13 | .. | test records until the total length is reached |
//!
//! A test record is a subject tag, for header subjects a length byte `L`
//! followed by `L` bytes of `name:` and a NUL, the argument lump, an operator
//! tag and, for `~`/`!~`, a lump holding the compiled pattern. A lump is a
//! big-endian `u32` length followed by that many bytes; the argument lump
//! includes its terminating NUL.

use super::pattern::PatternEngine;
use crate::error::BanError;
use http::HeaderName;
use std::fmt;

pub(crate) const BANS_TIMESTAMP: usize = 0;
pub(crate) const BANS_LENGTH: usize = 8;
pub(crate) const BANS_FLAGS: usize = 12;
pub(crate) const BANS_HEAD_LEN: usize = 13;

const BANS_FLAG_REQ: u8 = 0x01;

const BANS_OPER_EQ: u8 = 0x10;
const BANS_OPER_NEQ: u8 = 0x11;
const BANS_OPER_MATCH: u8 = 0x12;
const BANS_OPER_NMATCH: u8 = 0x13;

const BANS_ARG_URL: u8 = 0x18;
const BANS_ARG_REQHTTP: u8 = 0x19;
const BANS_ARG_OBJHTTP: u8 = 0x1a;
const BANS_ARG_OBJSTATUS: u8 = 0x1b;

/// Longest header name that fits the one-byte length prefix with its `:`.
const MAX_HEADER_NAME: usize = 126;

// ============================================================================
// Subjects and operators
// ============================================================================

/// What a test reads its left-hand side from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject<'a> {
    /// `req.url`
    RequestUrl,
    /// `req.http.<name>`
    RequestHeader(&'a str),
    /// `obj.http.<name>`
    ObjectHeader(&'a str),
    /// `obj.status`, compared as its decimal string.
    ObjectStatus,
}

impl<'a> Subject<'a> {
    /// Look up a field name in the table of bannable fields.
    pub fn parse(field: &'a str) -> Result<Self, BanError> {
        let subject = if field == "req.url" {
            Subject::RequestUrl
        } else if field == "obj.status" {
            Subject::ObjectStatus
        } else if let Some(name) = field.strip_prefix("req.http.") {
            Subject::RequestHeader(name)
        } else if let Some(name) = field.strip_prefix("obj.http.") {
            Subject::ObjectHeader(name)
        } else {
            return Err(BanError::InvalidField(field.to_string()));
        };

        if let Subject::RequestHeader(name) | Subject::ObjectHeader(name) = subject
            && (name.len() > MAX_HEADER_NAME || HeaderName::from_bytes(name.as_bytes()).is_err())
        {
            return Err(BanError::InvalidField(field.to_string()));
        }
        Ok(subject)
    }

    /// Whether evaluating this subject needs the request.
    #[inline]
    pub fn is_request_dependent(&self) -> bool {
        matches!(self, Subject::RequestUrl | Subject::RequestHeader(_))
    }

    fn tag(&self) -> u8 {
        match self {
            Subject::RequestUrl => BANS_ARG_URL,
            Subject::RequestHeader(_) => BANS_ARG_REQHTTP,
            Subject::ObjectHeader(_) => BANS_ARG_OBJHTTP,
            Subject::ObjectStatus => BANS_ARG_OBJSTATUS,
        }
    }
}

impl fmt::Display for Subject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::RequestUrl => f.write_str("req.url"),
            Subject::RequestHeader(name) => write!(f, "req.http.{}", name),
            Subject::ObjectHeader(name) => write!(f, "obj.http.{}", name),
            Subject::ObjectStatus => f.write_str("obj.status"),
        }
    }
}

/// Comparison applied between subject and argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `~`
    Match,
    /// `!~`
    NotMatch,
}

impl Operator {
    /// Parse an operator token.
    pub fn parse(token: &str) -> Result<Self, BanError> {
        match token {
            "==" => Ok(Operator::Equal),
            "!=" => Ok(Operator::NotEqual),
            "~" => Ok(Operator::Match),
            "!~" => Ok(Operator::NotMatch),
            _ => Err(BanError::InvalidOperator(token.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::Match => "~",
            Operator::NotMatch => "!~",
        }
    }

    /// Whether the operator carries a compiled pattern.
    #[inline]
    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Match | Operator::NotMatch)
    }

    fn tag(&self) -> u8 {
        match self {
            Operator::Equal => BANS_OPER_EQ,
            Operator::NotEqual => BANS_OPER_NEQ,
            Operator::Match => BANS_OPER_MATCH,
            Operator::NotMatch => BANS_OPER_NMATCH,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            BANS_OPER_EQ => Some(Operator::Equal),
            BANS_OPER_NEQ => Some(Operator::NotEqual),
            BANS_OPER_MATCH => Some(Operator::Match),
            BANS_OPER_NMATCH => Some(Operator::NotMatch),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One AND-ed condition decoded from a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanTest<'a> {
    pub subject: Subject<'a>,
    pub operator: Operator,
    pub literal: &'a str,
    /// Engine blob for `~` and `!~`.
    pub pattern: Option<&'a [u8]>,
}

impl fmt::Display for BanTest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.operator, self.literal)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates AND-ed tests for a ban that has not been inserted yet.
///
/// A test that fails validation is not appended, so the builder stays usable
/// and the ban list is never touched by a rejected condition.
pub struct BanBuilder<'e> {
    engine: &'e dyn PatternEngine,
    body: Vec<u8>,
    request_dependent: bool,
    tests: usize,
}

impl<'e> BanBuilder<'e> {
    pub fn new(engine: &'e dyn PatternEngine) -> Self {
        Self {
            engine,
            body: Vec::new(),
            request_dependent: false,
            tests: 0,
        }
    }

    /// Number of tests added so far.
    pub fn len(&self) -> usize {
        self.tests
    }

    pub fn is_empty(&self) -> bool {
        self.tests == 0
    }

    /// Add one `field op literal` condition.
    pub fn add_test(&mut self, field: &str, op: &str, literal: &str) -> Result<(), BanError> {
        let subject = Subject::parse(field)?;
        let operator = Operator::parse(op)?;
        if literal.as_bytes().contains(&0) {
            return Err(BanError::InvalidLiteral(field.to_string()));
        }
        let pattern = if operator.is_pattern() {
            Some(
                self.engine
                    .compile(literal)
                    .map_err(|d| BanError::PatternError(d.0))?,
            )
        } else {
            None
        };

        let mut rec = Vec::with_capacity(16 + literal.len());
        rec.push(subject.tag());
        if let Subject::RequestHeader(name) | Subject::ObjectHeader(name) = subject {
            // Length covers the name and its ':'; the NUL follows.
            rec.push((name.len() + 1) as u8);
            rec.extend_from_slice(name.as_bytes());
            rec.push(b':');
            rec.push(0);
        }
        let mut arg = Vec::with_capacity(literal.len() + 1);
        arg.extend_from_slice(literal.as_bytes());
        arg.push(0);
        push_lump(&mut rec, &arg)?;
        rec.push(operator.tag());
        if let Some(blob) = pattern {
            push_lump(&mut rec, &blob)?;
        }

        self.body.extend_from_slice(&rec);
        self.request_dependent |= subject.is_request_dependent();
        self.tests += 1;
        Ok(())
    }

    /// Finalize into a spec with a zero timestamp; the list stamps it on insert.
    pub fn finish(self) -> Result<BanSpec, BanError> {
        if self.tests == 0 {
            return Err(BanError::NoConditions);
        }
        assemble(&self.body, self.request_dependent)
    }
}

fn push_lump(out: &mut Vec<u8>, data: &[u8]) -> Result<(), BanError> {
    let len = u32::try_from(data.len()).map_err(|_| BanError::OutOfMemory)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn assemble(body: &[u8], request_dependent: bool) -> Result<BanSpec, BanError> {
    let total = BANS_HEAD_LEN + body.len();
    let len = u32::try_from(total).map_err(|_| BanError::OutOfMemory)?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(total)
        .map_err(|_| BanError::OutOfMemory)?;
    buf.extend_from_slice(&0f64.to_ne_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(if request_dependent { BANS_FLAG_REQ } else { 0 });
    buf.extend_from_slice(body);
    Ok(BanSpec(buf.into_boxed_slice()))
}

/// Encode a list of `(field, op, literal)` triples in one go.
pub fn encode(engine: &dyn PatternEngine, conditions: &[(&str, &str, &str)]) -> Result<BanSpec, BanError> {
    let mut builder = BanBuilder::new(engine);
    for (field, op, literal) in conditions {
        builder.add_test(field, op, literal)?;
    }
    builder.finish()
}

// ============================================================================
// Spec
// ============================================================================

/// The immutable encoded form of one ban.
#[derive(Clone, PartialEq, Eq)]
pub struct BanSpec(Box<[u8]>);

impl BanSpec {
    /// Spec of the permanent sentinel ban: no tests.
    pub(crate) fn sentinel() -> Self {
        // Empty body, so the only allocation is the header.
        Self(
            [
                &0f64.to_ne_bytes()[..],
                &(BANS_HEAD_LEN as u32).to_be_bytes()[..],
                &[0u8][..],
            ]
            .concat()
            .into_boxed_slice(),
        )
    }

    /// Adopt a buffer read back from storage, checking its structure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BanError> {
        if bytes.len() < BANS_HEAD_LEN {
            return Err(BanError::Corrupt("shorter than header"));
        }
        if header_len(bytes) != bytes.len() {
            return Err(BanError::Corrupt("length field disagrees with buffer"));
        }
        if bytes[BANS_FLAGS] & !BANS_FLAG_REQ != 0 {
            return Err(BanError::Corrupt("unknown flag bits"));
        }
        if !ban_time(bytes).is_finite() {
            return Err(BanError::Corrupt("timestamp is not finite"));
        }
        let mut pos = BANS_HEAD_LEN;
        let mut request_dependent = false;
        while pos < bytes.len() {
            let test = decode_test(bytes, &mut pos).map_err(BanError::Corrupt)?;
            request_dependent |= test.subject.is_request_dependent();
        }
        if request_dependent != (bytes[BANS_FLAGS] & BANS_FLAG_REQ != 0) {
            return Err(BanError::Corrupt("request flag disagrees with tests"));
        }
        Ok(Self(bytes.into()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn timestamp(&self) -> f64 {
        ban_time(&self.0)
    }

    /// Total encoded length, as recorded in the header.
    #[inline]
    pub fn len(&self) -> usize {
        header_len(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= BANS_HEAD_LEN
    }

    #[inline]
    pub fn is_request_dependent(&self) -> bool {
        self.0[BANS_FLAGS] & BANS_FLAG_REQ != 0
    }

    /// Iterate the tests in order.
    pub fn tests(&self) -> Tests<'_> {
        Tests {
            bytes: &self.0,
            pos: BANS_HEAD_LEN,
        }
    }

    /// Byte-identical conditions, ignoring the timestamp.
    ///
    /// Lengths are compared first, so a shorter spec is never over-read.
    pub fn same_conditions(&self, other: &BanSpec) -> bool {
        self.0.len() == other.0.len() && self.0[BANS_LENGTH..] == other.0[BANS_LENGTH..]
    }

    /// Human readable `field op arg && ...` form.
    pub fn render(&self) -> String {
        self.to_string()
    }

    pub(crate) fn set_timestamp(&mut self, t: f64) {
        self.0[BANS_TIMESTAMP..BANS_LENGTH].copy_from_slice(&t.to_ne_bytes());
    }
}

impl fmt::Display for BanSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, test) in self.tests().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{}", test)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BanSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BanSpec")
            .field("timestamp", &self.timestamp())
            .field("len", &self.len())
            .field("conditions", &self.to_string())
            .finish()
    }
}

fn ban_time(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[BANS_TIMESTAMP..BANS_LENGTH]);
    f64::from_ne_bytes(raw)
}

fn header_len(bytes: &[u8]) -> usize {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[BANS_LENGTH..BANS_FLAGS]);
    u32::from_be_bytes(raw) as usize
}

// ============================================================================
// Decoding
// ============================================================================

/// Lazy, restartable iterator over the tests of a spec.
///
/// The `BanSpec` was either built by [`BanBuilder`] or checked by
/// [`BanSpec::from_bytes`], so a malformed record means memory corruption and
/// is fatal.
#[derive(Clone)]
pub struct Tests<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Tests<'a> {
    type Item = BanTest<'a>;

    fn next(&mut self) -> Option<BanTest<'a>> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        match decode_test(self.bytes, &mut self.pos) {
            Ok(test) => Some(test),
            Err(what) => panic!("corrupt ban spec at offset {}: {}", self.pos, what),
        }
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], &'static str> {
    let end = pos.checked_add(n).ok_or("length overflow")?;
    let slice = bytes.get(*pos..end).ok_or("truncated test record")?;
    *pos = end;
    Ok(slice)
}

fn take_byte(bytes: &[u8], pos: &mut usize) -> Result<u8, &'static str> {
    take(bytes, pos, 1).map(|b| b[0])
}

fn take_lump<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], &'static str> {
    let raw = take(bytes, pos, 4)?;
    let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    take(bytes, pos, len)
}

fn decode_test<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<BanTest<'a>, &'static str> {
    let tag = take_byte(bytes, pos)?;
    let subject = match tag {
        BANS_ARG_URL => Subject::RequestUrl,
        BANS_ARG_OBJSTATUS => Subject::ObjectStatus,
        BANS_ARG_REQHTTP | BANS_ARG_OBJHTTP => {
            let l = take_byte(bytes, pos)? as usize;
            let raw = take(bytes, pos, l + 1)?;
            if l == 0 || raw[l - 1] != b':' || raw[l] != 0 {
                return Err("malformed header name");
            }
            let name = std::str::from_utf8(&raw[..l - 1]).map_err(|_| "header name not UTF-8")?;
            if tag == BANS_ARG_REQHTTP {
                Subject::RequestHeader(name)
            } else {
                Subject::ObjectHeader(name)
            }
        }
        _ => return Err("unknown subject tag"),
    };

    let arg = take_lump(bytes, pos)?;
    let (&nul, text) = arg.split_last().ok_or("empty argument lump")?;
    if nul != 0 {
        return Err("argument not NUL terminated");
    }
    let literal = std::str::from_utf8(text).map_err(|_| "argument not UTF-8")?;

    let operator = Operator::from_tag(take_byte(bytes, pos)?).ok_or("unknown operator tag")?;
    let pattern = if operator.is_pattern() {
        Some(take_lump(bytes, pos)?)
    } else {
        None
    };

    Ok(BanTest {
        subject,
        operator,
        literal,
        pattern,
    })
}
