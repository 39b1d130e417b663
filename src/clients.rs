pub(crate) mod notifier;
pub(crate) mod relay;
pub(crate) mod scraper;
