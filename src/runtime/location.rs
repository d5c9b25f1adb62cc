//! Script URL resolution.

use url::Url;

use crate::runtime::types::{WorkerError, WorkerResult};

/// Resolve `input` against `base`. Absolute inputs come back unchanged.
pub fn resolve_script_url(base: &Url, input: &str) -> WorkerResult<Url> {
    base.join(input).map_err(|source| WorkerError::InvalidUrl {
        url: input.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/app/").unwrap()
    }

    #[test]
    fn resolves_relative_input() {
        let url = resolve_script_url(&base(), "worker.js").unwrap();
        assert_eq!(url.as_str(), "https://example.com/app/worker.js");
    }

    #[test]
    fn keeps_absolute_input() {
        let input = "https://cdn.example.org/lib/worker.js";
        let url = resolve_script_url(&base(), input).unwrap();
        assert_eq!(url.as_str(), input);
    }

    #[test]
    fn object_urls_cannot_be_a_base() {
        let blob = Url::parse("blob:https://example.com/3").unwrap();
        let err = resolve_script_url(&blob, "helper.js").unwrap_err();
        assert!(matches!(err, WorkerError::InvalidUrl { .. }));
    }
}
