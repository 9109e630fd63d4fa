//! In-memory quote store.
//!
//! The real market-data snapshot store lives outside this service; the
//! daemon only needs the latest quote per ticker with an honest `as_of`.
//! Quotes arrive through `set_quote` (wired to the feed in production,
//! to the dev-only inject route in tests/paper mode). The risk gate treats
//! anything older than its staleness threshold as untrusted.

use async_trait::async_trait;
use harman_risk::{Quote, QuoteBook, QuoteSource};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct QuoteStore {
    quotes: RwLock<HashMap<String, Quote>>,
}

impl QuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_quote(&self, quote: Quote) {
        let mut quotes = self.quotes.write().await;
        quotes.insert(quote.ticker.clone(), quote);
    }

    /// Snapshot the quotes for a set of tickers (admission pre-fetch).
    pub async fn book_for<'a, I>(&self, tickers: I) -> QuoteBook
    where
        I: IntoIterator<Item = &'a str>,
    {
        let quotes = self.quotes.read().await;
        let mut book = QuoteBook::new();
        for ticker in tickers {
            if let Some(q) = quotes.get(ticker) {
                book.insert(ticker.to_string(), q.clone());
            }
        }
        book
    }
}

#[async_trait]
impl QuoteSource for QuoteStore {
    async fn lookup(&self, ticker: &str) -> Option<Quote> {
        let quotes = self.quotes.read().await;
        quotes.get(ticker).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn lookup_and_book() {
        let store = QuoteStore::new();
        assert!(store.lookup("A").await.is_none());

        store
            .set_quote(Quote {
                ticker: "A".to_string(),
                yes_bid_cents: 40,
                yes_ask_cents: 45,
                last_trade_cents: None,
                as_of: Utc::now(),
            })
            .await;

        assert_eq!(store.lookup("A").await.unwrap().yes_ask_cents, 45);
        let book = store.book_for(["A", "B"]).await;
        assert_eq!(book.len(), 1);
        assert!(book.contains_key("A"));
    }
}
