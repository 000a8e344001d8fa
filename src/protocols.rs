// Protocol catalog: the parsed, validated form of the per-chain protocol
// configuration. Built once per cycle and handed to the ingestor and decoder.

use std::str::FromStr;

use ethers::types::{Address, H256};
use log::info;

use crate::error::{Result, WhitelistError};
use crate::settings::ChainEntry;
use crate::types::Protocol;

/// One configured protocol variant on one chain.
#[derive(Debug, Clone)]
pub struct ProtocolSpec {
    pub protocol: Protocol,
    /// Variant tag carried into `DiscoveredPool` and used as the checkpoint
    /// key, e.g. "uniswap_v2", "aerodrome_v2".
    pub variant: String,
    pub factories: Vec<Address>,
    pub deployment_block: u64,
    /// topic0 of the creation event.
    pub topic: H256,
    /// Fee recorded for V2-family pools (the event does not carry one).
    pub default_fee: u32,
    /// Variant emits a stable flag in topic3.
    pub stable_flag: bool,
}

impl ProtocolSpec {
    /// Checkpoint key for this (chain, protocol variant).
    pub fn checkpoint_key(&self) -> &str {
        &self.variant
    }
}

/// All protocol specs for one chain.
#[derive(Debug, Clone)]
pub struct ProtocolCatalog {
    pub specs: Vec<ProtocolSpec>,
}

impl ProtocolCatalog {
    pub fn from_chain(chain: &str, entry: &ChainEntry) -> Result<Self> {
        let mut specs = Vec::with_capacity(entry.protocols.len());

        for proto in &entry.protocols {
            let protocol = Protocol::parse(&proto.protocol)?;

            let mut factories = Vec::with_capacity(proto.factories.len());
            for raw in &proto.factories {
                let addr = Address::from_str(raw).map_err(|_| {
                    WhitelistError::ConfigInvalid(format!(
                        "{chain}/{}: bad factory address '{raw}'",
                        proto.variant
                    ))
                })?;
                factories.push(addr);
            }
            if factories.is_empty() {
                return Err(WhitelistError::ConfigInvalid(format!(
                    "{chain}/{}: no factory addresses configured",
                    proto.variant
                )));
            }
            if protocol == Protocol::V4 && factories.len() != 1 {
                return Err(WhitelistError::ConfigInvalid(format!(
                    "{chain}/{}: v4 expects exactly one pool manager address",
                    proto.variant
                )));
            }

            let topic = H256::from_str(&proto.topic).map_err(|_| {
                WhitelistError::ConfigInvalid(format!(
                    "{chain}/{}: bad event topic '{}'",
                    proto.variant, proto.topic
                ))
            })?;

            specs.push(ProtocolSpec {
                protocol,
                variant: proto.variant.clone(),
                factories,
                deployment_block: proto.deployment_block,
                topic,
                default_fee: proto.default_fee,
                stable_flag: proto.stable_flag,
            });
        }

        if specs.is_empty() {
            return Err(WhitelistError::ConfigInvalid(format!(
                "{chain}: no protocols configured"
            )));
        }

        info!(
            "[Catalog] {} protocol variants configured for {}",
            specs.len(),
            chain
        );
        Ok(Self { specs })
    }
}
