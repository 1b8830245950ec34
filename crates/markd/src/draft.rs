/// Form input preprocessing
/// Drafts are validated before any request is issued, so invalid input never
/// reaches the reconciler.
use url::Url;

use crate::{MarkdError, NewBookmark, Result, UserId};

/// Raw form input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkDraft {
    pub url: String,
    pub title: String,
}

impl BookmarkDraft {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }

    /// Fill an empty title from the URL's hostname
    pub fn with_guessed_title(mut self) -> Self {
        if self.title.trim().is_empty() {
            if let Some(guess) = guess_title(&self.url) {
                self.title = guess;
            }
        }
        self
    }

    /// Validate and normalize into a create request for `user_id`
    pub fn validate(&self, user_id: &UserId) -> Result<NewBookmark> {
        if self.url.trim().is_empty() {
            return Err(MarkdError::Validation("Please enter a URL".to_string()));
        }

        let title = self.title.trim();
        if title.is_empty() {
            return Err(MarkdError::Validation("Please enter a title".to_string()));
        }

        let url = normalize_url(&self.url)?;

        Ok(NewBookmark {
            user_id: user_id.clone(),
            url,
            title: title.to_string(),
        })
    }
}

/// Trim and default the scheme to https. The result must be an absolute URL
/// with a host.
pub fn normalize_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    match Url::parse(&candidate) {
        Ok(parsed) if parsed.host_str().is_some_and(|host| !host.is_empty()) => Ok(candidate),
        _ => Err(MarkdError::Validation("Please enter a valid URL".to_string())),
    }
}

/// Hostname without a leading `www.`
pub fn guess_title(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.starts_with("http") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}
