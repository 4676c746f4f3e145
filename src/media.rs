//! Media-range handling for content negotiation.
//!
//! Wraps the `mime` vocabulary with the two operations the handler
//! selector needs: parsing `Accept` lists with quality values, and
//! ranking a produced media type against such a list.

use http::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use mime::Mime;

use crate::error::{Error, Result};

/// One entry of an `Accept` list: a media range plus its quality,
/// in thousandths (`q=0.5` is `500`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QualityItem {
    pub(crate) range: Mime,
    pub(crate) quality: u16,
}

/// Parses the request's `Accept` headers, preserving client order.
///
/// A missing or empty `Accept` means "anything": a single `*/*` at
/// full quality.
pub(crate) fn parse_accept(headers: &HeaderMap) -> Result<Vec<QualityItem>> {
    let mut items = Vec::new();
    for value in headers.get_all(ACCEPT) {
        let value = value.to_str().map_err(Error::new_media_type)?;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            items.push(parse_quality_item(part)?);
        }
    }
    if items.is_empty() {
        items.push(QualityItem {
            range: mime::STAR_STAR,
            quality: 1000,
        });
    }
    Ok(items)
}

fn parse_quality_item(s: &str) -> Result<QualityItem> {
    let range: Mime = s.parse().map_err(Error::new_media_type)?;
    let quality = match range.get_param("q") {
        Some(q) => parse_quality(q.as_str())?,
        None => 1000,
    };
    Ok(QualityItem { range, quality })
}

/// RFC 7231 quality value: up to three decimals, within `0..=1`.
fn parse_quality(s: &str) -> Result<u16> {
    if s.len() > 5 {
        return Err(Error::new_media_type(format!("invalid q value: {}", s)));
    }
    match s.parse::<f32>() {
        Ok(q) if (0.0..=1.0).contains(&q) => Ok((q * 1000.0).round() as u16),
        _ => Err(Error::new_media_type(format!("invalid q value: {}", s))),
    }
}

/// The request's `Content-Type`, if one was sent.
pub(crate) fn parse_content_type(headers: &HeaderMap) -> Result<Option<Mime>> {
    let value = match headers.get(CONTENT_TYPE) {
        Some(value) => value,
        None => return Ok(None),
    };
    let value = value.to_str().map_err(Error::new_media_type)?;
    let mime = value.parse::<Mime>().map_err(Error::new_media_type)?;
    Ok(Some(mime))
}

/// How precisely `range` names `candidate`: exact beats a subtype
/// wildcard beats a type wildcard beats `*/*`. `None` if the two are
/// not compatible at all. A wildcard on either side matches.
pub(crate) fn specificity(range: &Mime, candidate: &Mime) -> Option<u8> {
    let type_ok = range.type_() == mime::STAR
        || candidate.type_() == mime::STAR
        || range.type_() == candidate.type_();
    let subtype_ok = range.subtype() == mime::STAR
        || candidate.subtype() == mime::STAR
        || range.subtype() == candidate.subtype();
    if !type_ok || !subtype_ok {
        return None;
    }
    Some(
        match (range.type_() == mime::STAR, range.subtype() == mime::STAR) {
            (false, false) => 3,
            (false, true) => 2,
            (true, false) => 1,
            (true, true) => 0,
        },
    )
}

/// True when `range` covers `candidate` at any specificity.
pub(crate) fn covers(range: &Mime, candidate: &Mime) -> bool {
    specificity(range, candidate).is_some()
}

/// How concretely a produced type names itself; an exact producer
/// outranks one that produces a wildcard when the accept rank ties.
fn concreteness(produced: &Mime) -> u8 {
    let mut n = 0;
    if produced.type_() != mime::STAR {
        n += 1;
    }
    if produced.subtype() != mime::STAR {
        n += 1;
    }
    n
}

/// The best `(accept specificity, produced concreteness, quality,
/// client position)` score a produced media type earns against an
/// accept list; position counts down so a larger tuple is always a
/// better score.
pub(crate) type Score = (u8, u8, u16, usize);

pub(crate) fn score(produced: &Mime, accept: &[QualityItem]) -> Option<Score> {
    let mut best: Option<Score> = None;
    for (idx, item) in accept.iter().enumerate() {
        if item.quality == 0 {
            continue;
        }
        if let Some(spec) = specificity(&item.range, produced) {
            let candidate = (spec, concreteness(produced), item.quality, accept.len() - idx);
            if best.map(|b| candidate > b).unwrap_or(true) {
                best = Some(candidate);
            }
        }
    }
    best
}
