//! The publisher's serial filter chain.
//!
//! Filters run strictly in registration order, on the publisher's single
//! consumer thread. Each may mutate a log record's free-text fields or
//! request suppression; suppression halts the rest of the chain for that
//! record.

use beacon_framing::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Keep,
    Suppress,
}

/// A hook in the publisher's pipeline. Implementors may mutate `record`'s
/// caption, description, details, or exception messages in place.
pub trait Filter: Send + Sync {
    fn apply(&self, record: &mut LogRecord) -> FilterAction;
}

/// Registration-ordered sequence of filters, run serially for every record.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Run the chain against `record`. Returns `false` if any filter
    /// suppressed it (the caller must drop the record, not forward it to
    /// messengers or notifiers).
    pub fn apply(&self, record: &mut LogRecord) -> bool {
        for filter in &self.filters {
            if filter.apply(record) == FilterAction::Suppress {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_framing::Severity;

    fn sample_log(category: &str) -> LogRecord {
        LogRecord {
            sequence: 1,
            severity: Severity::Warning,
            category: category.to_string(),
            timestamp_ticks: 0,
            thread_id: 1,
            source: Default::default(),
            caption: "x".into(),
            description: "y".into(),
            details: None,
            exception: None,
            principal: None,
        }
    }

    struct SuppressCategory(&'static str);

    impl Filter for SuppressCategory {
        fn apply(&self, record: &mut LogRecord) -> FilterAction {
            if record.category == self.0 {
                FilterAction::Suppress
            } else {
                FilterAction::Keep
            }
        }
    }

    struct RedactCaption;

    impl Filter for RedactCaption {
        fn apply(&self, record: &mut LogRecord) -> FilterAction {
            record.caption = "redacted".to_string();
            FilterAction::Keep
        }
    }

    #[test]
    fn suppression_halts_the_rest_of_the_chain() {
        let mut chain = FilterChain::new();
        chain.register(Box::new(SuppressCategory("secret")));
        chain.register(Box::new(RedactCaption));

        let mut secret = sample_log("secret");
        assert!(!chain.apply(&mut secret));
        assert_eq!(secret.caption, "x"); // RedactCaption never ran.

        let mut ok = sample_log("ok");
        assert!(chain.apply(&mut ok));
        assert_eq!(ok.caption, "redacted");
    }

    #[test]
    fn suppressed_records_are_excluded_from_the_kept_set() {
        let mut chain = FilterChain::new();
        chain.register(Box::new(SuppressCategory("secret")));

        let mut records = vec![sample_log("secret"), sample_log("ok")];
        let mut kept = Vec::new();
        for record in &mut records {
            if chain.apply(record) {
                kept.push(record.category.clone());
            }
        }
        assert_eq!(kept, vec!["ok".to_string()]);
    }
}
