//! Token-creation decoding for transaction updates.
//!
//! A newly created token shows up as a transaction whose first post token
//! balance carries the mint. The creator is the owner of the second post
//! balance, and account keys 2 and 3 are the bonding curve and its
//! associated token account.

use tracing::{debug, info};
use yellowstone_grpc_proto::prelude::{
    subscribe_update::UpdateOneof, SubscribeUpdate, SubscribeUpdateTransaction,
};

use crate::stream::session::UpdateHandler;

const BONDING_CURVE_KEY_INDEX: usize = 2;
const ASSOCIATED_BONDING_CURVE_KEY_INDEX: usize = 3;

/// Fields decoded from a token-creation transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTokenEvent {
    pub slot: u64,
    pub signature: String,
    pub mint: String,
    pub creator: Option<String>,
    pub bonding_curve: Option<String>,
    pub associated_bonding_curve: Option<String>,
    pub decimals: Option<u32>,
    pub initial_supply: Option<f64>,
    pub fee_lamports: u64,
    pub success: bool,
}

impl NewTokenEvent {
    /// Decodes an update, returning `None` for anything that is not a
    /// transaction with a minted token balance.
    pub fn from_update(update: &SubscribeUpdate) -> Option<Self> {
        match update.update_oneof.as_ref()? {
            UpdateOneof::Transaction(transaction) => Self::from_transaction(transaction),
            _ => None,
        }
    }

    pub fn from_transaction(update: &SubscribeUpdateTransaction) -> Option<Self> {
        let info = update.transaction.as_ref()?;
        let meta = info.meta.as_ref()?;

        let balance = meta.post_token_balances.first()?;
        if balance.mint.is_empty() {
            return None;
        }

        let creator = meta
            .post_token_balances
            .get(1)
            .map(|balance| balance.owner.clone())
            .filter(|owner| !owner.is_empty());

        let account_keys = info
            .transaction
            .as_ref()
            .and_then(|tx| tx.message.as_ref())
            .map(|message| message.account_keys.as_slice())
            .unwrap_or_default();
        let key_at = |index: usize| {
            account_keys
                .get(index)
                .map(|key| bs58::encode(key).into_string())
        };

        let amount = balance.ui_token_amount.as_ref();

        Some(Self {
            slot: update.slot,
            signature: bs58::encode(&info.signature).into_string(),
            mint: balance.mint.clone(),
            creator,
            bonding_curve: key_at(BONDING_CURVE_KEY_INDEX),
            associated_bonding_curve: key_at(ASSOCIATED_BONDING_CURVE_KEY_INDEX),
            decimals: amount.map(|amount| amount.decimals),
            initial_supply: amount.map(|amount| amount.ui_amount),
            fee_lamports: meta.fee,
            success: meta.err.is_none(),
        })
    }

    /// Solscan link for the transaction.
    pub fn explorer_url(&self) -> String {
        format!("https://solscan.io/tx/{}", self.signature)
    }
}

/// Handler that logs every decoded token creation.
#[derive(Debug, Default)]
pub struct MintLogger {
    seen: u64,
}

impl MintLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of token creations logged so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl UpdateHandler for MintLogger {
    fn on_update(&mut self, update: SubscribeUpdate) {
        if let Some(UpdateOneof::Pong(pong)) = &update.update_oneof {
            debug!(event = "pong", id = pong.id);
            return;
        }

        let Some(event) = NewTokenEvent::from_update(&update) else {
            return;
        };
        self.seen += 1;

        info!(
            target: "mint",
            event = "new_token",
            index = self.seen,
            slot = event.slot,
            mint = %event.mint,
            creator = event.creator.as_deref().unwrap_or("unknown"),
            bonding_curve = event.bonding_curve.as_deref().unwrap_or("unknown"),
            associated_bonding_curve = event.associated_bonding_curve.as_deref().unwrap_or("unknown"),
            decimals = ?event.decimals,
            initial_supply = ?event.initial_supply,
            fee_lamports = event.fee_lamports,
            success = event.success,
            url = %event.explorer_url(),
            "new token created"
        );
    }
}
