//! Store doubles for failure and latency scenarios.

use std::future::pending;

use async_trait::async_trait;

use super::{AtomicStore, BucketState, SlidingWindowReply, TokenBucketReply};
use crate::error::{RatewardenError, Result};

/// Fails every call with a store error.
#[derive(Debug, Default)]
pub(crate) struct FailingStore;

fn unavailable<T>() -> Result<T> {
    Err(RatewardenError::Store("connection refused".to_string()))
}

#[async_trait]
impl AtomicStore for FailingStore {
    async fn fixed_window(&self, _: &str, _: u64, _: u64) -> Result<i64> {
        unavailable()
    }

    async fn sliding_window(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<SlidingWindowReply> {
        unavailable()
    }

    async fn token_bucket(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<TokenBucketReply> {
        unavailable()
    }

    async fn get_count(&self, _: &str) -> Result<i64> {
        unavailable()
    }

    async fn get_bucket(&self, _: &str) -> Result<Option<BucketState>> {
        unavailable()
    }

    async fn raise_count(&self, _: &str, _: i64, _: u64) -> Result<i64> {
        unavailable()
    }

    async fn delete(&self, _: &[String]) -> Result<()> {
        unavailable()
    }

    async fn record_event(&self, _: &str, _: &[String], _: u64) -> Result<()> {
        unavailable()
    }
}

/// Never answers.
#[derive(Debug, Default)]
pub(crate) struct StalledStore;

#[async_trait]
impl AtomicStore for StalledStore {
    async fn fixed_window(&self, _: &str, _: u64, _: u64) -> Result<i64> {
        pending().await
    }

    async fn sliding_window(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<SlidingWindowReply> {
        pending().await
    }

    async fn token_bucket(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<TokenBucketReply> {
        pending().await
    }

    async fn get_count(&self, _: &str) -> Result<i64> {
        pending().await
    }

    async fn get_bucket(&self, _: &str) -> Result<Option<BucketState>> {
        pending().await
    }

    async fn raise_count(&self, _: &str, _: i64, _: u64) -> Result<i64> {
        pending().await
    }

    async fn delete(&self, _: &[String]) -> Result<()> {
        pending().await
    }

    async fn record_event(&self, _: &str, _: &[String], _: u64) -> Result<()> {
        pending().await
    }
}
