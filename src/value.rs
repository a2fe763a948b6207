//! Dynamic values crossing the SQLite/PostgreSQL boundary.
//!
//! SQLite is dynamically typed; the backend's wire format is not. Binding
//! goes through a [`ToSql`] impl that accepts every parameter type and
//! renders the bound value according to what the server inferred. Results
//! come back through a [`FromSql`] impl that folds every common OID class
//! into the five SQLite storage classes.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use libc::c_int;
use postgres::types::{FromSql, IsNull, ToSql, Type};
use sqlite_interpose::abi;

type BoxError = Box<dyn StdError + Sync + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// The fundamental-type code `column_type`/`value_type` report.
    pub fn type_code(&self) -> c_int {
        match self {
            SqlValue::Null => abi::SQLITE_NULL,
            SqlValue::Int(_) => abi::SQLITE_INTEGER,
            SqlValue::Float(_) => abi::SQLITE_FLOAT,
            SqlValue::Text(_) => abi::SQLITE_TEXT,
            SqlValue::Blob(_) => abi::SQLITE_BLOB,
        }
    }

    /// SQLite's numeric coercion for `column_int`/`column_int64`.
    pub fn as_int(&self) -> i64 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Int(v) => *v,
            SqlValue::Float(v) => *v as i64,
            SqlValue::Text(s) => parse_leading_i64(s),
            SqlValue::Blob(_) => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            SqlValue::Null => 0.0,
            SqlValue::Int(v) => *v as f64,
            SqlValue::Float(v) => *v,
            SqlValue::Text(s) => s.trim().parse().unwrap_or(0.0),
            SqlValue::Blob(_) => 0.0,
        }
    }

    /// Text representation served by `column_text`; `None` for NULL.
    pub fn render_text(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(Cow::Owned(v.to_string().into_bytes())),
            SqlValue::Float(v) => Some(Cow::Owned(render_float(*v).into_bytes())),
            SqlValue::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            SqlValue::Blob(b) => Some(Cow::Borrowed(b)),
        }
    }

    /// What `column_bytes` reports: the byte length of the text (or blob)
    /// representation.
    pub fn byte_len(&self) -> usize {
        self.render_text().map(|b| b.len()).unwrap_or(0)
    }

    pub fn blob_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(b) => Some(b),
            SqlValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// SQLite renders integral reals with a trailing `.0`; match that so text
/// comparisons in the host keep working.
pub fn render_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn parse_leading_i64(s: &str) -> i64 {
    let t = s.trim();
    let end = t
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    t[..end].parse().unwrap_or_else(|_| {
        t.parse::<f64>().map(|f| f as i64).unwrap_or(0)
    })
}

// Type constants are not usable as match patterns, so dispatch on the
// inferred type is equality chains throughout.
fn is_textish(ty: &Type) -> bool {
    *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
}

fn bind_mismatch(what: &str, ty: &Type) -> BoxError {
    format!("cannot bind {what} as {ty}").into()
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Int(v) => encode_int(*v, ty, out),
            SqlValue::Float(v) => encode_float(*v, ty, out),
            SqlValue::Text(s) => encode_text(s, ty, out),
            SqlValue::Blob(b) => {
                if *ty == Type::BYTEA || is_textish(ty) {
                    out.put_slice(b);
                    Ok(IsNull::No)
                } else {
                    Err(bind_mismatch("blob", ty))
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    // Every type is accepted, so the checked variant has nothing to check.
    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        self.to_sql(ty, out)
    }
}

fn encode_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        out.put_i16(i16::try_from(v).map_err(|_| bind_mismatch("integer", ty))?);
    } else if *ty == Type::INT4 {
        out.put_i32(i32::try_from(v).map_err(|_| bind_mismatch("integer", ty))?);
    } else if *ty == Type::INT8 {
        out.put_i64(v);
    } else if *ty == Type::OID {
        out.put_u32(u32::try_from(v).map_err(|_| bind_mismatch("integer", ty))?);
    } else if *ty == Type::FLOAT4 {
        out.put_f32(v as f32);
    } else if *ty == Type::FLOAT8 {
        out.put_f64(v as f64);
    } else if *ty == Type::BOOL {
        out.put_u8(u8::from(v != 0));
    } else if *ty == Type::NUMERIC {
        encode_numeric(&v.to_string(), out)?;
    } else if is_textish(ty) {
        out.put_slice(v.to_string().as_bytes());
    } else {
        return Err(bind_mismatch("integer", ty));
    }
    Ok(IsNull::No)
}

fn encode_float(v: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::FLOAT4 {
        out.put_f32(v as f32);
    } else if *ty == Type::FLOAT8 {
        out.put_f64(v);
    } else if *ty == Type::INT2 {
        out.put_i16(v as i16);
    } else if *ty == Type::INT4 {
        out.put_i32(v as i32);
    } else if *ty == Type::INT8 {
        out.put_i64(v as i64);
    } else if *ty == Type::NUMERIC {
        encode_numeric(&render_float(v), out)?;
    } else if is_textish(ty) {
        out.put_slice(render_float(v).as_bytes());
    } else {
        return Err(bind_mismatch("real", ty));
    }
    Ok(IsNull::No)
}

fn encode_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        out.put_i16(s.trim().parse().map_err(|_| bind_mismatch("text", ty))?);
    } else if *ty == Type::INT4 {
        out.put_i32(s.trim().parse().map_err(|_| bind_mismatch("text", ty))?);
    } else if *ty == Type::INT8 {
        out.put_i64(s.trim().parse().map_err(|_| bind_mismatch("text", ty))?);
    } else if *ty == Type::FLOAT4 {
        out.put_f32(s.trim().parse().map_err(|_| bind_mismatch("text", ty))?);
    } else if *ty == Type::FLOAT8 {
        out.put_f64(s.trim().parse().map_err(|_| bind_mismatch("text", ty))?);
    } else if *ty == Type::BOOL {
        out.put_u8(parse_bool(s).ok_or_else(|| bind_mismatch("text", ty))?);
    } else if *ty == Type::NUMERIC {
        encode_numeric(s.trim(), out)?;
    } else if *ty == Type::TIMESTAMP {
        let ts = parse_datetime(s).ok_or_else(|| bind_mismatch("text", ty))?;
        return ts.to_sql(ty, out);
    } else if *ty == Type::TIMESTAMPTZ {
        let ts = parse_datetime(s).ok_or_else(|| bind_mismatch("text", ty))?;
        return DateTime::<Utc>::from_naive_utc_and_offset(ts, Utc).to_sql(ty, out);
    } else if *ty == Type::DATE {
        let d = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| bind_mismatch("text", ty))?;
        return d.to_sql(ty, out);
    } else if *ty == Type::TIME {
        let t = NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
            .map_err(|_| bind_mismatch("text", ty))?;
        return t.to_sql(ty, out);
    } else if *ty == Type::JSONB {
        out.put_u8(1);
        out.put_slice(s.as_bytes());
    } else if *ty == Type::UUID {
        out.put_slice(&parse_uuid(s).ok_or_else(|| bind_mismatch("text", ty))?);
    } else {
        // BYTEA, JSON and every text-shaped type take the raw bytes.
        out.put_slice(s.as_bytes());
    }
    Ok(IsNull::No)
}

fn parse_bool(s: &str) -> Option<u8> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(1),
        "0" | "f" | "false" | "no" | "off" => Some(0),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let t = s.trim();
    NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(t, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        out[i] = u8::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
    }
    Some(out)
}

fn format_uuid(raw: &[u8]) -> String {
    let mut s = String::with_capacity(36);
    for (i, b) in raw.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        let _ = write!(s, "{b:02x}");
    }
    s
}

impl<'a> FromSql<'a> for SqlValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<SqlValue, BoxError> {
        let value = if *ty == Type::BOOL {
            SqlValue::Int(i64::from(bool::from_sql(ty, raw)?))
        } else if *ty == Type::CHAR {
            SqlValue::Int(i64::from(i8::from_sql(ty, raw)?))
        } else if *ty == Type::INT2 {
            SqlValue::Int(i64::from(i16::from_sql(ty, raw)?))
        } else if *ty == Type::INT4 {
            SqlValue::Int(i64::from(i32::from_sql(ty, raw)?))
        } else if *ty == Type::INT8 {
            SqlValue::Int(i64::from_sql(ty, raw)?)
        } else if *ty == Type::OID {
            SqlValue::Int(i64::from(u32::from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT4 {
            SqlValue::Float(f64::from(f32::from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT8 {
            SqlValue::Float(f64::from_sql(ty, raw)?)
        } else if *ty == Type::NUMERIC {
            numeric_value(&decode_numeric(raw)?)
        } else if *ty == Type::BYTEA {
            SqlValue::Blob(raw.to_vec())
        } else if *ty == Type::TIMESTAMP {
            SqlValue::Text(
                NaiveDateTime::from_sql(ty, raw)?
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            )
        } else if *ty == Type::TIMESTAMPTZ {
            SqlValue::Text(
                DateTime::<Utc>::from_sql(ty, raw)?
                    .naive_utc()
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            )
        } else if *ty == Type::DATE {
            SqlValue::Text(NaiveDate::from_sql(ty, raw)?.format("%Y-%m-%d").to_string())
        } else if *ty == Type::TIME {
            SqlValue::Text(NaiveTime::from_sql(ty, raw)?.format("%H:%M:%S").to_string())
        } else if *ty == Type::JSONB {
            let body = raw.get(1..).unwrap_or(&[]);
            SqlValue::Text(String::from_utf8_lossy(body).into_owned())
        } else if *ty == Type::UUID {
            SqlValue::Text(format_uuid(raw))
        } else {
            // JSON and anything else lands as its text bytes.
            SqlValue::Text(String::from_utf8_lossy(raw).into_owned())
        };
        Ok(value)
    }

    fn from_sql_null(_ty: &Type) -> Result<SqlValue, BoxError> {
        Ok(SqlValue::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn numeric_value(text: &str) -> SqlValue {
    if !text.contains('.') {
        if let Ok(v) = text.parse::<i64>() {
            return SqlValue::Int(v);
        }
    }
    match text.parse::<f64>() {
        Ok(v) => SqlValue::Float(v),
        Err(_) => SqlValue::Text(text.to_string()),
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Encode a plain decimal string into the backend's base-10000 wire format.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let (neg, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("not a decimal literal: {text:?}").into());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(format!("not a decimal literal: {text:?}").into());
    }

    let dscale = frac_part.len() as u16;
    let int_trimmed = int_part.trim_start_matches('0');
    let lead_pad = (4 - int_trimmed.len() % 4) % 4;
    let mut all = String::with_capacity(lead_pad + int_trimmed.len() + frac_part.len() + 3);
    all.extend(std::iter::repeat('0').take(lead_pad));
    all.push_str(int_trimmed);
    let int_groups = all.len() / 4;
    all.push_str(frac_part);
    while all.len() % 4 != 0 {
        all.push('0');
    }

    let mut groups: Vec<u16> = all
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap().parse::<u16>().unwrap())
        .collect();
    let mut weight = int_groups as i16 - 1;
    // Strip zero groups from both ends; weight tracks the first kept group.
    let leading_zero = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading_zero);
    weight -= leading_zero as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    out.put_u16(groups.len() as u16);
    out.put_i16(weight);
    out.put_u16(if neg && !groups.is_empty() { NUMERIC_NEG } else { 0 });
    out.put_u16(dscale);
    for g in groups {
        out.put_u16(g);
    }
    Ok(())
}

/// Decode the backend's base-10000 wire format into a decimal string.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let take_u16 = |i: usize| -> Result<u16, BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric".into())
    };
    let ndigits = take_u16(0)? as usize;
    let weight = take_u16(1)? as i16;
    let sign = take_u16(2)?;
    let dscale = take_u16(3)? as usize;
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }

    let mut int_text = String::new();
    let mut frac_text = String::new();
    for i in 0..ndigits {
        let group = take_u16(4 + i)?;
        let pos = weight - i as i16;
        if pos >= 0 {
            if int_text.is_empty() {
                let _ = write!(int_text, "{group}");
            } else {
                let _ = write!(int_text, "{group:04}");
            }
        } else {
            let _ = write!(frac_text, "{group:04}");
        }
    }
    // Groups the wire omitted are zeros.
    if weight >= 0 {
        let int_groups_present = (0..ndigits)
            .filter(|i| weight - *i as i16 >= 0)
            .count();
        for _ in int_groups_present..(weight as usize + 1) {
            if int_text.is_empty() {
                int_text.push('0');
            } else {
                int_text.push_str("0000");
            }
        }
    }
    if weight < -1 {
        let missing = (-weight - 1) as usize;
        frac_text.insert_str(0, &"0".repeat(missing * 4));
    }
    if int_text.is_empty() {
        int_text.push('0');
    }

    // Fraction is exactly dscale digits wide.
    if frac_text.len() < dscale {
        frac_text.push_str(&"0".repeat(dscale - frac_text.len()));
    } else {
        frac_text.truncate(dscale);
    }

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    out.push_str(&int_text);
    if !frac_text.is_empty() {
        out.push('.');
        out.push_str(&frac_text);
    }
    Ok(out)
}

/// Marker distinguishing engine-owned `sqlite3_value` pointers from the
/// original library's. The interposed `value_*` accessors read the first
/// eight bytes of whatever pointer the host hands them; a mismatch means
/// the value came from a forwarded statement and belongs to the original
/// functions.
pub const VALUE_MAGIC: u64 = 0x7067_4c54_5641_4c31;

#[repr(C)]
pub struct TaggedValue {
    magic: u64,
    pub value: SqlValue,
    text: Option<std::ffi::CString>,
}

impl TaggedValue {
    pub fn boxed(value: SqlValue) -> Box<TaggedValue> {
        Box::new(TaggedValue {
            magic: VALUE_MAGIC,
            value,
            text: None,
        })
    }

    pub fn as_abi(&mut self) -> *mut abi::sqlite3_value {
        self as *mut TaggedValue as *mut abi::sqlite3_value
    }

    /// Reinterpret a host-supplied value pointer if it carries our tag.
    ///
    /// # Safety
    /// `ptr` must be a readable `sqlite3_value` pointer (engine-owned or
    /// from the original library).
    pub unsafe fn from_abi<'a>(ptr: *mut abi::sqlite3_value) -> Option<&'a mut TaggedValue> {
        if ptr.is_null() {
            return None;
        }
        let candidate = ptr as *mut TaggedValue;
        if std::ptr::read_unaligned(candidate as *const u64) != VALUE_MAGIC {
            return None;
        }
        Some(&mut *candidate)
    }

    /// NUL-terminated text of the value, cached in the box; null pointer
    /// for NULL values.
    pub fn text_ptr(&mut self) -> *const libc::c_uchar {
        match self.value.render_text() {
            None => std::ptr::null(),
            Some(bytes) => {
                if self.text.is_none() {
                    let sanitised: Vec<u8> =
                        bytes.iter().copied().filter(|b| *b != 0).collect();
                    self.text = Some(std::ffi::CString::new(sanitised).unwrap_or_default());
                }
                self.text.as_ref().unwrap().as_ptr() as *const libc::c_uchar
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_roundtrip(text: &str) -> String {
        let mut buf = BytesMut::new();
        encode_numeric(text, &mut buf).unwrap();
        decode_numeric(&buf).unwrap()
    }

    #[test]
    fn numeric_integers_roundtrip() {
        assert_eq!(numeric_roundtrip("0"), "0");
        assert_eq!(numeric_roundtrip("42"), "42");
        assert_eq!(numeric_roundtrip("10000"), "10000");
        assert_eq!(numeric_roundtrip("123456789"), "123456789");
        assert_eq!(numeric_roundtrip("-12345"), "-12345");
    }

    #[test]
    fn numeric_fractions_roundtrip() {
        assert_eq!(numeric_roundtrip("3.14"), "3.14");
        assert_eq!(numeric_roundtrip("-0.5"), "-0.5");
        assert_eq!(numeric_roundtrip("0.0001"), "0.0001");
        assert_eq!(numeric_roundtrip("12000.340"), "12000.340");
    }

    #[test]
    fn numeric_rejects_garbage() {
        let mut buf = BytesMut::new();
        assert!(encode_numeric("1,5", &mut buf).is_err());
        assert!(encode_numeric("", &mut buf).is_err());
    }

    #[test]
    fn int_coercions_follow_sqlite_rules() {
        assert_eq!(SqlValue::Text("42abc".into()).as_int(), 42);
        assert_eq!(SqlValue::Text(" -7 ".into()).as_int(), -7);
        assert_eq!(SqlValue::Text("junk".into()).as_int(), 0);
        assert_eq!(SqlValue::Float(3.9).as_int(), 3);
        assert_eq!(SqlValue::Null.as_int(), 0);
        assert_eq!(SqlValue::Blob(vec![1, 2]).as_int(), 0);
    }

    #[test]
    fn float_render_keeps_trailing_zero() {
        assert_eq!(render_float(1.0), "1.0");
        assert_eq!(render_float(2.5), "2.5");
        assert_eq!(render_float(-3.0), "-3.0");
    }

    #[test]
    fn type_codes() {
        assert_eq!(SqlValue::Null.type_code(), abi::SQLITE_NULL);
        assert_eq!(SqlValue::Int(1).type_code(), abi::SQLITE_INTEGER);
        assert_eq!(SqlValue::Float(1.0).type_code(), abi::SQLITE_FLOAT);
        assert_eq!(SqlValue::Text(String::new()).type_code(), abi::SQLITE_TEXT);
        assert_eq!(SqlValue::Blob(Vec::new()).type_code(), abi::SQLITE_BLOB);
    }

    #[test]
    fn int_binds_by_inferred_type() {
        let mut buf = BytesMut::new();
        encode_int(7, &Type::INT4, &mut buf).unwrap();
        assert_eq!(&buf[..], &7i32.to_be_bytes());

        let mut buf = BytesMut::new();
        encode_int(7, &Type::TEXT, &mut buf).unwrap();
        assert_eq!(&buf[..], b"7");

        let mut buf = BytesMut::new();
        assert!(encode_int(i64::MAX, &Type::INT4, &mut buf).is_err());
    }

    #[test]
    fn text_binds_parse_for_numeric_targets() {
        let mut buf = BytesMut::new();
        encode_text("123", &Type::INT8, &mut buf).unwrap();
        assert_eq!(&buf[..], &123i64.to_be_bytes());

        let mut buf = BytesMut::new();
        assert!(encode_text("not a number", &Type::INT8, &mut buf).is_err());
    }

    #[test]
    fn tagged_value_roundtrip_through_abi_pointer() {
        let mut v = TaggedValue::boxed(SqlValue::Int(7));
        let p = v.as_abi();
        let back = unsafe { TaggedValue::from_abi(p) }.unwrap();
        assert_eq!(back.value.as_int(), 7);
        assert!(!back.text_ptr().is_null());

        let mut foreign = [0u8; 64];
        let fp = foreign.as_mut_ptr() as *mut abi::sqlite3_value;
        assert!(unsafe { TaggedValue::from_abi(fp) }.is_none());
    }

    #[test]
    fn tagged_null_text_is_null_pointer() {
        let mut v = TaggedValue::boxed(SqlValue::Null);
        assert!(v.text_ptr().is_null());
    }

    #[test]
    fn uuid_text_roundtrip() {
        let parsed = parse_uuid("123e4567-e89b-12d3-a456-426614174000").unwrap();
        assert_eq!(format_uuid(&parsed), "123e4567-e89b-12d3-a456-426614174000");
    }
}
