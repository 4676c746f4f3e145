//! Handler selection on a matched route.
//!
//! Filters the route's endpoints by method, then by request content
//! type, and ranks the survivors against the client's `Accept` list.
//! Exactly one endpoint must remain at the top rank.

use http::Method;
use mime::Mime;

use crate::error::{Error, Result};
use crate::handler::Endpoint;
use crate::media::{self, QualityItem};
use crate::route::Route;

pub(crate) fn select(
    route: &Route,
    method: &Method,
    content_type: Option<&Mime>,
    accept: &[QualityItem],
) -> Result<Endpoint> {
    let mut best: Vec<&Endpoint> = Vec::new();
    let mut best_score = None;

    for endpoint in route.endpoints() {
        if endpoint.method() != method {
            continue;
        }
        if !endpoint.consumes_pred().accepts(content_type) {
            continue;
        }
        let score = produced_score(endpoint, accept);
        let score = match score {
            Some(score) => score,
            None => continue,
        };
        match best_score {
            None => {
                best_score = Some(score);
                best.push(endpoint);
            }
            Some(current) if score > current => {
                best_score = Some(score);
                best.clear();
                best.push(endpoint);
            }
            Some(current) if score == current => {
                best.push(endpoint);
            }
            Some(_) => {}
        }
    }

    match best.len() {
        0 => Err(Error::new_no_handler()),
        1 => Ok(best[0].clone()),
        _ => Err(Error::new_ambiguous_handler()),
    }
}

/// The endpoint's best score over everything it can produce.
fn produced_score(endpoint: &Endpoint, accept: &[QualityItem]) -> Option<media::Score> {
    let star = [mime::STAR_STAR];
    let produced = if endpoint.produced().is_empty() {
        &star[..]
    } else {
        endpoint.produced()
    };
    produced
        .iter()
        .filter_map(|mime| media::score(mime, accept))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::{Consumes, Endpoint};
    use crate::request::Request;
    use crate::route::Route;
    use http::header::{HeaderMap, ACCEPT};

    async fn noop(_req: Request, _ch: Channel) -> Result<()> {
        Ok(())
    }

    fn accept(value: &str) -> Vec<QualityItem> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, value.parse().unwrap());
        media::parse_accept(&headers).unwrap()
    }

    fn route_of(endpoints: Vec<Endpoint>) -> Route {
        let mut builder = Route::builder("/x").unwrap();
        for ep in endpoints {
            builder = builder.endpoint(ep).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn filters_by_method() {
        let route = route_of(vec![Endpoint::get(noop)]);
        let err = select(&route, &Method::POST, None, &accept("*/*")).unwrap_err();
        assert!(err.is_no_handler());
        assert!(select(&route, &Method::GET, None, &accept("*/*")).is_ok());
    }

    #[test]
    fn filters_by_content_type() {
        let json = Endpoint::post(noop)
            .consumes(Consumes::Of("application/json".parse().unwrap()))
            .produces(mime::APPLICATION_JSON);
        let route = route_of(vec![json]);

        let ct: Mime = "application/json".parse().unwrap();
        assert!(select(&route, &Method::POST, Some(&ct), &accept("*/*")).is_ok());

        let err = select(&route, &Method::POST, None, &accept("*/*")).unwrap_err();
        assert!(err.is_no_handler());

        let text: Mime = "text/plain".parse().unwrap();
        let err = select(&route, &Method::POST, Some(&text), &accept("*/*")).unwrap_err();
        assert!(err.is_no_handler());
    }

    #[test]
    fn prefers_the_more_acceptable_producer() {
        let plain = Endpoint::get(noop).produces(mime::TEXT_PLAIN);
        let json = Endpoint::get(noop).produces(mime::APPLICATION_JSON);
        let route = route_of(vec![plain, json]);

        let chosen = select(
            &route,
            &Method::GET,
            None,
            &accept("application/json, text/plain;q=0.5"),
        )
        .unwrap();
        assert_eq!(chosen.produced()[0], mime::APPLICATION_JSON);
    }

    #[test]
    fn exact_accept_beats_wildcard_producer() {
        let any = Endpoint::get(noop);
        let plain = Endpoint::get(noop).produces(mime::TEXT_PLAIN);
        let route = route_of(vec![any, plain]);

        let chosen = select(&route, &Method::GET, None, &accept("text/plain")).unwrap();
        assert_eq!(chosen.produced(), &[mime::TEXT_PLAIN]);
    }

    #[test]
    fn unacceptable_producer_is_excluded() {
        let json = Endpoint::get(noop).produces(mime::APPLICATION_JSON);
        let route = route_of(vec![json]);
        let err = select(&route, &Method::GET, None, &accept("text/plain")).unwrap_err();
        assert!(err.is_no_handler());
    }

    #[test]
    fn equal_rank_is_ambiguous() {
        let a = Endpoint::get(noop).produces(mime::TEXT_PLAIN);
        let b = Endpoint::get(noop)
            .consumes(Consumes::Nothing)
            .produces(mime::TEXT_PLAIN);
        let route = route_of(vec![a, b]);
        let err = select(&route, &Method::GET, None, &accept("text/plain")).unwrap_err();
        assert!(err.is_ambiguous_handler());
    }
}
