//! Firestore placeholder
//!
//! Selectable by provider name so configurations round-trip, but every
//! operation fails until a Firestore client is wired in.

use super::{DataAdapter, Provider, QueryResult};
use crate::error::{DataError, Result};
use crate::query::UniversalQuery;
use crate::security::User;
use async_trait::async_trait;
use serde_json::Value;

pub struct FirestoreAdapter {
    credentials: Value,
}

impl FirestoreAdapter {
    pub fn new(credentials: Value) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Value {
        &self.credentials
    }
}

#[async_trait]
impl DataAdapter for FirestoreAdapter {
    fn provider(&self) -> Provider {
        Provider::Firestore
    }

    async fn query(&self, query: &UniversalQuery, _user: &User) -> Result<QueryResult> {
        Err(DataError::adapter(
            Provider::Firestore,
            query.describe(),
            anyhow::anyhow!("the firestore adapter is not implemented"),
        ))
    }

    async fn test_connection(&self) -> bool {
        false
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
