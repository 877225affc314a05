//! iCalendar (RFC 5545) invitations for scheduled conferences

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::info::{truncate_seconds, ConferenceInfo, ConferenceInfoState, SecurityLevel};
use crate::conference::ParticipantRole;
use crate::errors::{ConferenceError, Result};
use crate::types::SipAddress;

const PRODID: &str = "-//sipconf//Conference calendar//EN";
const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
/// Maximum length of a content line in octets, CRLF excluded
const FOLD_LIMIT: usize = 75;

const ROLE_SPEAKER: &str = "REQ-PARTICIPANT";
const ROLE_LISTENER: &str = "NON-PARTICIPANT";

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split a content line into chunks of at most 75 octets, continuation
/// lines starting with a space
fn fold(line: &str, out: &mut String) {
    let mut limit = FOLD_LIMIT;
    let mut current = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if current + len > limit {
            out.push_str("\r\n ");
            current = 0;
            // The leading space counts
            limit = FOLD_LIMIT - 1;
        }
        out.push(c);
        current += len;
    }
    out.push_str("\r\n");
}

fn unfold(body: &str) -> String {
    body.replace("\r\n ", "")
        .replace("\r\n\t", "")
        .replace("\n ", "")
        .replace("\n\t", "")
}

fn format_date(time: &DateTime<Utc>) -> String {
    time.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| ConferenceError::ics(format!("invalid date {}: {}", value, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn format_duration(minutes: u32) -> String {
    let hours = minutes / 60;
    let minutes = minutes % 60;
    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 || hours == 0 {
        out.push_str(&format!("{}M", minutes));
    }
    out
}

/// Parse `P[nW][nD][T[nH][nM][nS]]` into minutes
fn parse_duration(value: &str) -> Result<u32> {
    let invalid = || ConferenceError::ics(format!("invalid duration {}", value));
    let rest = value.strip_prefix('P').ok_or_else(invalid)?;

    let mut seconds: u64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            d if d.is_ascii_digit() => number.push(d),
            unit => {
                let n: u64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let scale: u64 = match (unit, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return Err(invalid()),
                };
                seconds = n
                    .checked_mul(scale)
                    .and_then(|part| seconds.checked_add(part))
                    .ok_or_else(invalid)?;
            }
        }
    }
    if !number.is_empty() {
        return Err(invalid());
    }
    u32::try_from(seconds / 60).map_err(|_| invalid())
}

fn event_uid(info: &ConferenceInfo) -> String {
    let domain = info
        .uri
        .as_ref()
        .or(info.organizer.as_ref())
        .map(|a| a.domain.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let local = info
        .uri
        .as_ref()
        .and_then(|u| u.conference_id().map(str::to_owned))
        .unwrap_or_else(|| format_date(&info.created_at));
    format!("{}@{}", local, domain)
}

/// Serialize a scheduling record as a calendar invitation. A cancelled
/// record produces a `METHOD:CANCEL` calendar.
pub fn to_ics(info: &ConferenceInfo) -> String {
    let cancelled = info.state == ConferenceInfoState::Cancelled;
    let mut lines: Vec<String> = vec![
        "BEGIN:VCALENDAR".to_string(),
        format!("METHOD:{}", if cancelled { "CANCEL" } else { "REQUEST" }),
        format!("PRODID:{}", PRODID),
        "VERSION:2.0".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}", event_uid(info)),
        format!("DTSTAMP:{}", format_date(&info.created_at)),
    ];

    if let Some(start) = &info.start_time {
        lines.push(format!("DTSTART:{}", format_date(start)));
    }
    if info.duration_minutes > 0 {
        lines.push(format!("DURATION:{}", format_duration(info.duration_minutes)));
    }
    if let Some(organizer) = &info.organizer {
        lines.push(format!("ORGANIZER:{}", organizer));
    }
    for participant in &info.participants {
        let role = match participant.role {
            ParticipantRole::Speaker => ROLE_SPEAKER,
            ParticipantRole::Listener => ROLE_LISTENER,
        };
        lines.push(format!("ATTENDEE;ROLE={}:{}", role, participant.address));
    }
    if let Some(uri) = &info.uri {
        lines.push(format!("X-CONFURI:{}", uri));
    }
    if let Some(ccmp) = &info.ccmp_uri {
        lines.push(format!("X-CCMPURI:{}", ccmp));
    }
    lines.push(format!("X-SECURITY-LEVEL:{}", info.security_level.as_str()));
    if !info.subject.is_empty() {
        lines.push(format!("SUMMARY:{}", escape_text(&info.subject)));
    }
    if !info.description.is_empty() {
        lines.push(format!("DESCRIPTION:{}", escape_text(&info.description)));
    }
    lines.push(format!("SEQUENCE:{}", info.ics_sequence));
    if cancelled {
        lines.push("STATUS:CANCELLED".to_string());
    }
    lines.push("END:VEVENT".to_string());
    lines.push("END:VCALENDAR".to_string());

    let mut out = String::new();
    for line in &lines {
        fold(line, &mut out);
    }
    out
}

/// One `NAME;PARAM=VALUE:value` content line
struct ContentLine<'a> {
    name: String,
    params: Vec<(&'a str, &'a str)>,
    value: &'a str,
}

impl<'a> ContentLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let (head, value) = line.split_once(':')?;
        let mut parts = head.split(';');
        let name = parts.next()?.trim().to_ascii_uppercase();
        let params = parts.filter_map(|p| p.split_once('=')).collect();
        Some(Self { name, params, value })
    }

    fn param(&self, key: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| *v)
    }
}

/// Parse a calendar invitation back into a scheduling record
pub fn from_ics(body: &str) -> Result<ConferenceInfo> {
    let unfolded = unfold(body);

    let mut in_event = false;
    let mut seen_event = false;
    let mut cancel_method = false;
    let mut status_cancelled = false;
    let mut created_at = None;

    let mut info = ConferenceInfo {
        organizer: None,
        ..ConferenceInfo::new(SipAddress::new("anonymous", "localhost"))
    };

    for raw in unfolded.lines() {
        let raw = raw.trim_end_matches('\r');
        if raw.is_empty() {
            continue;
        }
        let line = ContentLine::parse(raw).ok_or_else(|| ConferenceError::ics(format!("malformed line: {}", raw)))?;

        match (line.name.as_str(), in_event) {
            ("BEGIN", _) if line.value.eq_ignore_ascii_case("VEVENT") => {
                in_event = true;
                seen_event = true;
            }
            ("END", true) if line.value.eq_ignore_ascii_case("VEVENT") => in_event = false,
            ("METHOD", false) => cancel_method = line.value.eq_ignore_ascii_case("CANCEL"),
            ("DTSTAMP", true) => created_at = Some(parse_date(line.value)?),
            ("DTSTART", true) => info.start_time = Some(parse_date(line.value)?),
            ("DURATION", true) => info.duration_minutes = parse_duration(line.value)?,
            ("ORGANIZER", true) => info.organizer = Some(SipAddress::parse(line.value)?),
            ("ATTENDEE", true) => {
                let role = match line.param("ROLE") {
                    Some(r) if r.eq_ignore_ascii_case(ROLE_LISTENER) => ParticipantRole::Listener,
                    _ => ParticipantRole::Speaker,
                };
                info.add_participant(SipAddress::parse(line.value)?, role);
            }
            ("X-CONFURI", true) => info.uri = Some(SipAddress::parse(line.value)?),
            ("X-CCMPURI", true) => info.ccmp_uri = Some(SipAddress::parse(line.value)?),
            ("X-SECURITY-LEVEL", true) => {
                info.security_level = SecurityLevel::parse(line.value)
                    .ok_or_else(|| ConferenceError::ics(format!("unknown security level {}", line.value)))?;
            }
            ("SUMMARY", true) => info.subject = unescape_text(line.value),
            ("DESCRIPTION", true) => info.description = unescape_text(line.value),
            ("SEQUENCE", true) => {
                info.ics_sequence = line
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| ConferenceError::ics(format!("invalid sequence {}", line.value)))?;
            }
            ("STATUS", true) => status_cancelled = line.value.eq_ignore_ascii_case("CANCELLED"),
            _ => {}
        }
    }

    if !seen_event {
        return Err(ConferenceError::ics("calendar has no VEVENT"));
    }

    info.created_at = created_at.map(truncate_seconds).unwrap_or(info.created_at);
    info.state = if cancel_method || status_cancelled {
        ConferenceInfoState::Cancelled
    } else if info.ics_sequence == 0 {
        ConferenceInfoState::New
    } else {
        ConferenceInfoState::Updated
    };
    Ok(info)
}
