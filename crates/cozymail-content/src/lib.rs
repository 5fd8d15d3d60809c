use std::borrow::Cow;

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, addrparse};

use cozymail_core::FetchedMessage;

const TEXT_WIDTH_COLS: usize = 100;
const MIN_PLAUSIBLE_YEAR: i32 = 1970;
const MAX_PLAUSIBLE_YEAR: i32 = 2100;

/// Parses a raw RFC 822 message into the record the pipeline works on.
pub fn parse_message(uid: u32, raw: &[u8]) -> Result<FetchedMessage> {
    let parsed = mailparse::parse_mail(raw)?;

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let from = parsed.headers.get_first_value("From").unwrap_or_default();
    let to = parsed.headers.get_first_value("To").unwrap_or_default();
    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| plausible_date(&v));
    let headers = parsed
        .headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect();

    let html_raw = find_part(&parsed, "text/html").unwrap_or_default();
    let html_body = if html_raw.is_empty() {
        String::new()
    } else {
        sanitize_html(&html_raw)
    };
    let text = match find_part(&parsed, "text/plain") {
        Some(text) => text,
        None if !html_body.is_empty() => {
            html2text::from_read(html_body.as_bytes(), TEXT_WIDTH_COLS)
        }
        None => String::new(),
    };

    Ok(FetchedMessage {
        uid,
        message_id,
        date,
        sender_address: first_address(&from),
        to_address: first_address(&to),
        from,
        subject,
        headers,
        text,
        html_body,
        html_raw,
        raw: String::from_utf8_lossy(raw).to_string(),
    })
}

/// Bare address of the first mailbox in an address header, or the trimmed
/// header itself when it does not parse.
pub fn first_address(header: &str) -> String {
    let parsed = match addrparse(header) {
        Ok(list) => list,
        Err(_) => return header.trim().to_string(),
    };
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => return info.addr.clone(),
            MailAddr::Group(group) => {
                if let Some(first) = group.addrs.first() {
                    return first.addr.clone();
                }
            }
        }
    }
    header.trim().to_string()
}

fn plausible_date(raw: &str) -> Option<String> {
    let ts = mailparse::dateparse(raw.trim()).ok()?;
    let dt = DateTime::<Utc>::from_timestamp(ts, 0)?;
    if !(MIN_PLAUSIBLE_YEAR..=MAX_PLAUSIBLE_YEAR).contains(&dt.year()) {
        return None;
    }
    Some(dt.to_rfc3339())
}

/// Strips active content and tracking vectors: scripts, frames, embeds,
/// stylesheets, event handlers, remote images and background images.
/// Link targets are neutralised to `#`.
pub fn sanitize_html(html: &str) -> String {
    let mut builder = ammonia::Builder::default();
    builder.add_generic_attributes(["style", "bgcolor"]);
    builder.add_tags(["font", "center"]);
    builder.add_tag_attributes("font", ["face", "size", "color"]);
    builder.attribute_filter(|_element, attribute, value| match attribute {
        "href" => Some(Cow::Borrowed("#")),
        "src" => Some(Cow::Borrowed("")),
        "background" => None,
        "style" => {
            let lower = value.to_ascii_lowercase();
            if lower.contains("background-image") || lower.contains("background:") {
                None
            } else {
                Some(Cow::Borrowed(value))
            }
        }
        _ => Some(Cow::Borrowed(value)),
    });
    builder.clean(html).to_string()
}

fn find_part(parsed: &ParsedMail, mimetype: &str) -> Option<String> {
    let mut found: Option<String> = None;
    walk_parts(parsed, &mut |part| {
        if found.is_some() || !part.subparts.is_empty() {
            return;
        }
        if is_attachment(part) {
            return;
        }
        if part.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            if let Ok(body) = part.get_body() {
                found = Some(body);
            }
        }
    });
    found
}

fn is_attachment(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        mailparse::DispositionType::Attachment
    )
}

fn walk_parts<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    cb(parsed);
    for part in &parsed.subparts {
        walk_parts(part, cb);
    }
}
