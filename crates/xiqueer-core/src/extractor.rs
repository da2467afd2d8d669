//! Timetable extraction from captured schedule responses.
//!
//! The schedule endpoint answers with a JavaScript object literal rather than
//! JSON: unquoted keys, single-quoted values without escaping, and one list per
//! weekday:
//!
//! ```text
//! {jcflag:'0',maxzc:'18',zc:'02',xn:'2025',xq:'1',qssj:'2026-03-09',
//!  jssj:'2026-03-15',week1:[{kcmc:'...',rkjs:'...',skdd:'...',jcxx:'1-2'}],
//!  sjhjinfo:[]}
//! ```
//!
//! The scanner below reads scalar fields by name and walks the weekday lists
//! one course object at a time. Unknown fields are ignored, field order does
//! not matter, and a malformed course object is dropped without affecting its
//! siblings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::CourseOccurrence;

/// Token that starts the timetable payload inside a response body.
pub const PAYLOAD_MARKER: &str = "{jcflag:'";

/// Key that follows the last weekday list in known server versions.
const TRAILER_KEY: &str = ",sjhjinfo:";

/// Length of the hex prefix kept from the request digest.
const DIGEST_PREFIX_LEN: usize = 10;

/// One week of timetable data extracted from a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPayload {
    /// Academic year (`xn`).
    pub academic_year: String,
    /// Term (`xq`).
    pub term: String,
    /// Week number (`zc`).
    pub week_no: u32,
    /// Declared total weeks (`maxzc`), 0 when absent.
    pub max_week: u32,
    /// First day of the week (`qssj`).
    pub period_start: String,
    /// Last day of the week (`jssj`).
    pub period_end: String,
    /// Course occurrences, all tagged with `week_no`.
    pub courses: Vec<CourseOccurrence>,
}

/// Returns true if the body carries a timetable payload.
pub fn contains_payload(body: &str) -> bool {
    body.contains(PAYLOAD_MARKER)
}

/// Extracts one week of timetable data from a response body.
///
/// Returns `None` when the marker is missing (not a timetable response) or
/// when one of the mandatory scalars `xn`, `xq`, `zc` is missing.
pub fn extract(body: &str) -> Option<ParsedPayload> {
    let start = body.find(PAYLOAD_MARKER)?;
    let payload = &body[start..];

    let academic_year = find_field(payload, "xn")?.to_string();
    let term = find_field(payload, "xq")?.to_string();
    let week_no = find_field(payload, "zc")?.trim().parse::<u32>().ok()?;
    let max_week = find_field(payload, "maxzc")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let period_start = find_field(payload, "qssj").unwrap_or_default().to_string();
    let period_end = find_field(payload, "jssj").unwrap_or_default().to_string();

    let mut courses = Vec::new();
    for block in week_blocks(payload) {
        for object in course_objects(block.body) {
            match parse_course(object, block.weekday, week_no) {
                Some(course) => courses.push(course),
                None => tracing::debug!(
                    "Dropped course object in week{} block: {}",
                    block.weekday,
                    object
                ),
            }
        }
    }

    Some(ParsedPayload {
        academic_year,
        term,
        week_no,
        max_week,
        period_start,
        period_end,
        courses,
    })
}

/// Fingerprints the `param`/`param2` form fields of a captured request.
///
/// The result is `"<10 hex chars>:<len param>/<len param2>"`, or an empty
/// string when both fields are blank. Diagnostics only.
///
/// Lengths count Unicode scalar values, not UTF-16 units, and a field only
/// matches on its exact key (`xparam=` is not `param=`). Digests of
/// non-ASCII or oddly keyed bodies can therefore differ from other tools that
/// fingerprint the same request.
pub fn digest_request_params(request_body: &str) -> String {
    let param = form_field(request_body, "param").unwrap_or_default();
    let param2 = form_field(request_body, "param2").unwrap_or_default();
    if param.trim().is_empty() && param2.trim().is_empty() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", param, param2).as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!(
        "{}:{}/{}",
        &digest[..DIGEST_PREFIX_LEN],
        param.chars().count(),
        param2.chars().count()
    )
}

/// Finds the first `name:'value'` at the top of a field list.
///
/// The key must start the payload or follow a comma, so `zc` never matches
/// inside `maxzc`.
fn find_field<'a>(payload: &'a str, name: &str) -> Option<&'a str> {
    let token = format!("{}:'", name);
    let bytes = payload.as_bytes();
    let mut from = 0;

    while let Some(rel) = payload[from..].find(&token) {
        let at = from + rel;
        if at == 0 || bytes[at - 1] == b',' {
            let value_start = at + token.len();
            let len = payload[value_start..].find('\'')?;
            return Some(&payload[value_start..value_start + len]);
        }
        from = at + 1;
    }

    None
}

/// A `weekN:[...]` list body.
struct WeekBlock<'a> {
    weekday: u8,
    body: &'a str,
}

fn week_blocks(payload: &str) -> Vec<WeekBlock<'_>> {
    let bytes = payload.as_bytes();
    let mut blocks = Vec::new();
    let mut from = 0;

    while let Some(rel) = payload[from..].find("week") {
        let at = from + rel;
        let digit = at + 4;

        let header = bytes.get(digit..digit + 3);
        let weekday = match header {
            Some([d @ b'1'..=b'7', b':', b'[']) => *d - b'0',
            _ => {
                from = digit;
                continue;
            }
        };

        let body_start = digit + 3;
        // Every later header would search the same brackets, so stop here.
        let Some(body_end) = find_block_end(payload, body_start) else {
            tracing::debug!("week{} list has no recognised terminator", weekday);
            break;
        };

        blocks.push(WeekBlock {
            weekday,
            body: &payload[body_start..body_end],
        });
        from = body_end + 1;
    }

    blocks
}

/// Position of the `]` that closes a weekday list.
fn find_block_end(payload: &str, body_start: usize) -> Option<usize> {
    let mut from = body_start;
    while let Some(rel) = payload[from..].find(']') {
        let at = from + rel;
        if is_block_terminator(&payload[at + 1..]) {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

/// A list ends before the next weekday key, the trailer key, or the closing
/// brace of the whole payload.
fn is_block_terminator(rest: &str) -> bool {
    if rest.starts_with(TRAILER_KEY) {
        return true;
    }
    if let Some(after) = rest.strip_prefix(",week") {
        return matches!(after.as_bytes(), [b'1'..=b'7', b':', ..]);
    }
    if let Some(after) = rest.strip_prefix('}') {
        return after.trim().is_empty();
    }
    false
}

/// Contents of each `{...}` in a weekday list.
fn course_objects(block: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut from = 0;

    while let Some(rel) = block[from..].find('{') {
        let open = from + rel;
        let Some(len) = block[open + 1..].find('}') else {
            break;
        };
        objects.push(&block[open + 1..open + 1 + len]);
        from = open + 1 + len + 1;
    }

    objects
}

/// Reads every `name:'value'` pair of a course object. Later duplicates win.
fn course_fields(object: &str) -> HashMap<&str, &str> {
    let bytes = object.as_bytes();
    let mut fields = HashMap::new();
    let mut from = 0;

    while let Some(rel) = object[from..].find(":'") {
        let colon = from + rel;
        let mut name_start = colon;
        while name_start > from && is_word_byte(bytes[name_start - 1]) {
            name_start -= 1;
        }
        if name_start == colon {
            from = colon + 1;
            continue;
        }

        let value_start = colon + 2;
        let Some(len) = object[value_start..].find('\'') else {
            break;
        };
        fields.insert(
            &object[name_start..colon],
            &object[value_start..value_start + len],
        );
        from = value_start + len + 1;
    }

    fields
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn parse_course(object: &str, weekday: u8, week_no: u32) -> Option<CourseOccurrence> {
    let fields = course_fields(object);
    let field = |name: &str| fields.get(name).map(|v| v.trim()).unwrap_or_default();

    let (start_section, end_section) = parse_period(field("jcxx"))?;
    let course_name = field("kcmc");
    if course_name.is_empty() {
        return None;
    }

    Some(CourseOccurrence {
        course_name: course_name.to_string(),
        weekday,
        start_section,
        end_section,
        teacher: field("rkjs").to_string(),
        location: field("skdd").to_string(),
        week_no,
    })
}

/// Reduces period text such as `1-2`, `3` or `第5-6节` to inclusive bounds.
fn parse_period(text: &str) -> Option<(u32, u32)> {
    let mut numbers = text
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|run| run.parse::<u32>().ok());

    let first = numbers.next()?;
    let last = numbers.last().unwrap_or(first);
    Some((first.min(last), first.max(last)))
}

/// Value of a form-encoded field, up to the next `&`. The key must be a whole
/// pair name; no substring matches.
fn form_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split('&')
        .find_map(|pair| pair.strip_prefix(key)?.strip_prefix('='))
}
