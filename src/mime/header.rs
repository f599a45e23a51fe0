//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sealpost.
//
// Sealpost is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sealpost is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sealpost. If not, see <http://www.gnu.org/licenses/>.

//! Parsing for the handful of MIME header fields the codec needs to
//! understand: `Content-Type`, `Content-Disposition`,
//! `Content-Transfer-Encoding` and `Content-ID`.

use std::borrow::Cow;
use std::str;

use nom::{
    branch::alt,
    bytes::complete::{is_not, take, take_while1},
    character::complete::char,
    combinator::{map, opt},
    multi::many0,
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

/// A parsed `Content-Type` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentType<'a> {
    pub typ: Cow<'a, [u8]>,
    pub subtype: Cow<'a, [u8]>,
    pub parms: Vec<(Cow<'a, [u8]>, Cow<'a, [u8]>)>,
}

impl ContentType<'_> {
    pub fn is_type(&self, typ: &str) -> bool {
        self.typ.eq_ignore_ascii_case(typ.as_bytes())
    }

    pub fn is_subtype(&self, subtype: &str) -> bool {
        self.subtype.eq_ignore_ascii_case(subtype.as_bytes())
    }

    pub fn is(&self, typ: &str, subtype: &str) -> bool {
        self.is_type(typ) && self.is_subtype(subtype)
    }

    pub fn parm(&self, name: &str) -> Option<&[u8]> {
        find_parm(&self.parms, name)
    }

    /// Whether the given parameter is present and equal, ignoring ASCII case,
    /// to `value`.
    pub fn parm_is(&self, name: &str, value: &str) -> bool {
        self.parm(name)
            .is_some_and(|v| v.eq_ignore_ascii_case(value.as_bytes()))
    }

    pub fn into_owned(self) -> ContentType<'static> {
        ContentType {
            typ: Cow::Owned(self.typ.into_owned()),
            subtype: Cow::Owned(self.subtype.into_owned()),
            parms: owned_parms(self.parms),
        }
    }
}

/// A parsed `Content-Disposition` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDisposition<'a> {
    pub disposition: Cow<'a, [u8]>,
    pub parms: Vec<(Cow<'a, [u8]>, Cow<'a, [u8]>)>,
}

impl ContentDisposition<'_> {
    pub fn is_attachment(&self) -> bool {
        self.disposition.eq_ignore_ascii_case(b"attachment")
    }

    /// The file name, preferring the RFC 2231 `filename*` form.
    pub fn filename(&self) -> Option<String> {
        extended_parm(&self.parms, "filename")
    }

    pub fn into_owned(self) -> ContentDisposition<'static> {
        ContentDisposition {
            disposition: Cow::Owned(self.disposition.into_owned()),
            parms: owned_parms(self.parms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ContentTransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
}

/// The `name` parameter of a content type, preferring the RFC 2231 form.
pub fn content_type_name(ct: &ContentType<'_>) -> Option<String> {
    extended_parm(&ct.parms, "name")
}

pub fn parse_content_type(value: &[u8]) -> Option<ContentType<'_>> {
    content_type(value).ok().map(|(_, ct)| ct)
}

pub fn parse_content_disposition(
    value: &[u8],
) -> Option<ContentDisposition<'_>> {
    content_disposition(value).ok().map(|(_, cd)| cd)
}

pub fn parse_content_transfer_encoding(
    value: &[u8],
) -> Option<ContentTransferEncoding> {
    use self::ContentTransferEncoding as CTE;

    let (_, name) = delimited(cfws, token, cfws)(value).ok()?;
    let name = str::from_utf8(name).ok()?.to_ascii_lowercase();
    match &name[..] {
        "7bit" => Some(CTE::SevenBit),
        "8bit" => Some(CTE::EightBit),
        "binary" => Some(CTE::Binary),
        "base64" => Some(CTE::Base64),
        "quoted-printable" => Some(CTE::QuotedPrintable),
        _ => None,
    }
}

/// Extract the message id from a `Content-ID` header, without the angle
/// brackets.
pub fn parse_content_id(value: &[u8]) -> Option<String> {
    let s = String::from_utf8_lossy(value);
    let s = s.trim();
    let s = s.strip_prefix('<').unwrap_or(s);
    let s = s.strip_suffix('>').unwrap_or(s);
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

fn find_parm<'a>(
    parms: &'a [(Cow<'_, [u8]>, Cow<'_, [u8]>)],
    name: &str,
) -> Option<&'a [u8]> {
    parms
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, v)| &v[..])
}

fn owned_parms(
    parms: Vec<(Cow<'_, [u8]>, Cow<'_, [u8]>)>,
) -> Vec<(Cow<'static, [u8]>, Cow<'static, [u8]>)> {
    parms
        .into_iter()
        .map(|(k, v)| (Cow::Owned(k.into_owned()), Cow::Owned(v.into_owned())))
        .collect()
}

/// Look up `name*` (RFC 2231, UTF-8 or ASCII only) falling back to plain
/// `name`.
fn extended_parm(
    parms: &[(Cow<'_, [u8]>, Cow<'_, [u8]>)],
    name: &str,
) -> Option<String> {
    let extended = format!("{}*", name);
    find_parm(parms, &extended)
        .and_then(decode_rfc2231)
        .or_else(|| {
            find_parm(parms, name)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        })
}

fn decode_rfc2231(value: &[u8]) -> Option<String> {
    let mut parts = value.splitn(3, |&b| b'\'' == b);
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;

    if !charset.eq_ignore_ascii_case(b"utf-8")
        && !charset.eq_ignore_ascii_case(b"us-ascii")
    {
        return None;
    }

    let mut decoded = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if b'%' == encoded[i] {
            if let Some(b) = encoded
                .get(i + 1..i + 3)
                .and_then(|h| str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                decoded.push(b);
                i += 3;
                continue;
            }
        }
        decoded.push(encoded[i]);
        i += 1;
    }

    String::from_utf8(decoded).ok()
}

/// Percent-encode `value` as an RFC 2231 `utf-8''...` parameter value.
pub fn encode_rfc2231(value: &str) -> String {
    let mut out = String::from("utf-8''");
    for &b in value.as_bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Quote `value` as an RFC 2045 quoted-string.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if '"' == ch || '\\' == ch {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

// RFC 2045 "tspecials" plus SPACE and CTLs are excluded from tokens.
fn is_token_char(b: u8) -> bool {
    b > b' ' && b < 0x7f && !b"()<>@,;:\\\"/[]?=".contains(&b)
}

fn token(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(is_token_char)(i)
}

// Header values arrive unfolded only partially, so line endings count as
// plain whitespace here.
fn whitespace(i: &[u8]) -> IResult<&[u8], ()> {
    map(take_while1(|b: u8| b" \t\r\n".contains(&b)), |_| ())(i)
}

// RFC 822 comment, which may nest.
fn comment(i: &[u8]) -> IResult<&[u8], ()> {
    map(
        delimited(
            char('('),
            many0(alt((
                map(is_not("()\\"), |_| ()),
                map(preceded(char('\\'), take(1usize)), |_| ()),
                comment,
            ))),
            char(')'),
        ),
        |_| (),
    )(i)
}

fn cfws(i: &[u8]) -> IResult<&[u8], ()> {
    map(many0(alt((whitespace, comment))), |_| ())(i)
}

fn quoted_string(i: &[u8]) -> IResult<&[u8], Cow<[u8]>> {
    delimited(
        char('"'),
        map(
            many0(alt((is_not("\\\""), preceded(char('\\'), take(1usize))))),
            |pieces: Vec<&[u8]>| match pieces.len() {
                0 => Cow::Borrowed(&b""[..]),
                1 => Cow::Borrowed(pieces[0]),
                _ => Cow::Owned(pieces.concat()),
            },
        ),
        char('"'),
    )(i)
}

fn parm_value(i: &[u8]) -> IResult<&[u8], Cow<[u8]>> {
    alt((quoted_string, map(token, Cow::Borrowed)))(i)
}

fn parameter(i: &[u8]) -> IResult<&[u8], (Cow<[u8]>, Cow<[u8]>)> {
    preceded(
        tuple((cfws, char(';'), cfws)),
        separated_pair(
            map(token, Cow::Borrowed),
            tuple((cfws, char('='), cfws)),
            parm_value,
        ),
    )(i)
}

fn parameters(i: &[u8]) -> IResult<&[u8], Vec<(Cow<[u8]>, Cow<[u8]>)>> {
    // Anything unparseable after the last good parameter (typically a stray
    // semicolon) is ignored.
    many0(parameter)(i)
}

fn content_type(i: &[u8]) -> IResult<&[u8], ContentType<'_>> {
    map(
        tuple((
            cfws,
            token,
            cfws,
            char('/'),
            cfws,
            token,
            parameters,
            opt(cfws),
        )),
        |(_, typ, _, _, _, subtype, parms, _)| ContentType {
            typ: Cow::Borrowed(typ),
            subtype: Cow::Borrowed(subtype),
            parms,
        },
    )(i)
}

fn content_disposition(i: &[u8]) -> IResult<&[u8], ContentDisposition<'_>> {
    map(
        tuple((cfws, token, parameters)),
        |(_, disposition, parms)| ContentDisposition {
            disposition: Cow::Borrowed(disposition),
            parms,
        },
    )(i)
}
