//! Subscription and keep-alive request builders.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use yellowstone_grpc_proto::prelude::{
    CommitmentLevel, SubscribeRequest, SubscribeRequestFilterTransactions, SubscribeRequestPing,
};

/// Filter label used for the transaction subscription.
pub const DEFAULT_FILTER_LABEL: &str = "pumpdotfun";

/// Identifier carried by every keep-alive ping.
pub const PING_ID: i32 = 1;

/// Commitment level requested from the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Commitment {
    #[default]
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    /// Lowercase name, as accepted by `COMMITMENT`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }

    fn level(self) -> CommitmentLevel {
        match self {
            Commitment::Processed => CommitmentLevel::Processed,
            Commitment::Confirmed => CommitmentLevel::Confirmed,
            Commitment::Finalized => CommitmentLevel::Finalized,
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(format!("unknown commitment level `{other}`")),
        }
    }
}

/// Immutable description of what a session subscribes to.
///
/// Built once from configuration and converted into the wire request with
/// [`SubscriptionRequest::to_subscribe_request`] on every (re)connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    label: String,
    account_include: Vec<String>,
    account_exclude: Vec<String>,
    account_required: Vec<String>,
    commitment: Commitment,
    include_vote: bool,
    include_failed: bool,
}

impl SubscriptionRequest {
    /// Transactions that mention `account`, at `processed` commitment,
    /// excluding votes and failed transactions.
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            label: DEFAULT_FILTER_LABEL.to_string(),
            account_include: vec![account.into()],
            account_exclude: Vec::new(),
            account_required: Vec::new(),
            commitment: Commitment::default(),
            include_vote: false,
            include_failed: false,
        }
    }

    /// Sets the commitment level requested from the stream.
    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    /// Enables or disables delivery of failed transactions.
    pub fn with_failed(mut self, include_failed: bool) -> Self {
        self.include_failed = include_failed;
        self
    }

    /// Drops transactions that mention any of `accounts`.
    pub fn with_excluded(mut self, accounts: Vec<String>) -> Self {
        self.account_exclude = accounts;
        self
    }

    /// Keeps only transactions that mention all of `accounts`.
    pub fn with_required(mut self, accounts: Vec<String>) -> Self {
        self.account_required = accounts;
        self
    }

    /// Sets the key the transaction filter is registered under. Updates
    /// echo it back in their `filters` list.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Builds the wire request sent as the first message of a session.
    pub fn to_subscribe_request(&self) -> SubscribeRequest {
        let filter = SubscribeRequestFilterTransactions {
            vote: Some(self.include_vote),
            failed: Some(self.include_failed),
            signature: None,
            account_include: self.account_include.clone(),
            account_exclude: self.account_exclude.clone(),
            account_required: self.account_required.clone(),
            ..Default::default()
        };

        let mut transactions = HashMap::new();
        transactions.insert(self.label.clone(), filter);

        SubscribeRequest {
            transactions,
            commitment: Some(self.commitment.level() as i32),
            ..Default::default()
        }
    }
}

/// Builds the keep-alive request: a ping with no filters attached.
pub fn ping_request() -> SubscribeRequest {
    SubscribeRequest {
        ping: Some(SubscribeRequestPing { id: PING_ID }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_filter_is_carried_unchanged() {
        let request = SubscriptionRequest::for_account("ADDR123").to_subscribe_request();
        let filter = request
            .transactions
            .get(DEFAULT_FILTER_LABEL)
            .expect("transaction filter");
        assert_eq!(filter.account_include, vec!["ADDR123".to_string()]);
        assert!(filter.account_exclude.is_empty());
        assert!(filter.account_required.is_empty());
        assert_eq!(filter.vote, Some(false));
        assert_eq!(filter.failed, Some(false));
    }

    #[test]
    fn subscription_only_requests_transactions() {
        let request = SubscriptionRequest::for_account("ADDR123")
            .with_commitment(Commitment::Confirmed)
            .to_subscribe_request();
        assert_eq!(request.commitment, Some(CommitmentLevel::Confirmed as i32));
        assert!(request.accounts.is_empty());
        assert!(request.slots.is_empty());
        assert!(request.blocks.is_empty());
        assert!(request.ping.is_none());
    }

    #[test]
    fn custom_label_keys_the_filter() {
        let request = SubscriptionRequest::for_account("ADDR123")
            .with_label("mints")
            .with_failed(true)
            .to_subscribe_request();
        let filter = request.transactions.get("mints").expect("labelled filter");
        assert_eq!(filter.failed, Some(true));
        assert!(!request.transactions.contains_key(DEFAULT_FILTER_LABEL));
    }

    #[test]
    fn exclude_and_required_lists_reach_the_filter() {
        let request = SubscriptionRequest::for_account("ADDR123")
            .with_excluded(vec!["VOTE111".to_string()])
            .with_required(vec!["ADDR123".to_string(), "CURVE42".to_string()])
            .to_subscribe_request();
        let filter = request
            .transactions
            .get(DEFAULT_FILTER_LABEL)
            .expect("transaction filter");
        assert_eq!(filter.account_exclude, vec!["VOTE111".to_string()]);
        assert_eq!(
            filter.account_required,
            vec!["ADDR123".to_string(), "CURVE42".to_string()]
        );
    }

    #[test]
    fn ping_request_has_constant_id_and_no_filters() {
        let ping = ping_request();
        assert_eq!(ping.ping.map(|p| p.id), Some(PING_ID));
        assert!(ping.transactions.is_empty());
        assert!(ping.commitment.is_none());
    }

    #[test]
    fn commitment_parses_case_insensitively() {
        assert_eq!("Confirmed".parse::<Commitment>(), Ok(Commitment::Confirmed));
        assert_eq!(" finalized ".parse::<Commitment>(), Ok(Commitment::Finalized));
        assert!("rooted".parse::<Commitment>().is_err());
    }
}
