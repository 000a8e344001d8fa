// Per-protocol creation-event decoders. Each variant is a pure function of
// the raw log; rejects carry a reason and are counted by the caller.
//
// Layouts:
//   V2 PairCreated:  token0 = topic1[12..], token1 = topic2[12..],
//                    pair = data[12..32], pair index = data[32..64]
//   V3 PoolCreated:  token0/token1 as above, fee = uint24(topic3),
//                    tick_spacing = int24(data[0..32]), pool = data[44..64]
//   V4 Initialize:   pool_id = topic1 (full 32 bytes), token0 = topic2,
//                    token1 = topic3,
//                    data = (fee u24, tick_spacing i24, hooks addr,
//                            sqrt_price u160, tick i24)

use ethers::types::{Address, H256};

use crate::error::{Result, WhitelistError};
use crate::metrics;
use crate::protocols::ProtocolSpec;
use crate::types::{DiscoveredPool, PoolId, Protocol, RawLogEvent};

/// Decodes one creation event according to the variant's layout. The
/// emitting contract must already be one of the spec's factories; the caller
/// filters by address and topic0 before handing events here.
pub fn decode_event(spec: &ProtocolSpec, event: &RawLogEvent) -> Result<DiscoveredPool> {
    let decoded = match spec.protocol {
        Protocol::V2 => decode_v2(spec, event),
        Protocol::V3 => decode_v3(spec, event),
        Protocol::V4 => decode_v4(spec, event),
    };
    if decoded.is_err() {
        metrics::increment_decode_failed(&spec.variant);
    }
    decoded
}

fn decode_v2(spec: &ProtocolSpec, event: &RawLogEvent) -> Result<DiscoveredPool> {
    let needed_topics = if spec.stable_flag { 4 } else { 3 };
    if event.topics.len() < needed_topics {
        return Err(reject(spec, event, "PairCreated needs indexed token0/token1"));
    }
    if event.data.len() < 64 {
        return Err(reject(spec, event, "PairCreated data shorter than 64 bytes"));
    }

    let token0 = address_from_topic(&event.topics[1]);
    let token1 = address_from_topic(&event.topics[2]);
    let pair = Address::from_slice(&event.data[12..32]);
    let stable = if spec.stable_flag {
        // Aerodrome-style variants index the stable flag as topic3.
        Some(event.topics[3].as_bytes()[31] != 0)
    } else {
        None
    };

    let (token0, token1, was_swapped) = canonical_order(token0, token1);

    Ok(DiscoveredPool {
        pool_id: PoolId::Address(pair),
        protocol: Protocol::V2,
        variant: spec.variant.clone(),
        factory: event.address,
        token0,
        token1,
        fee: Some(spec.default_fee),
        tick_spacing: None,
        stable,
        hooks: None,
        creation_block: event.block_number,
        was_swapped,
    })
}

fn decode_v3(spec: &ProtocolSpec, event: &RawLogEvent) -> Result<DiscoveredPool> {
    if event.topics.len() < 4 {
        return Err(reject(spec, event, "PoolCreated needs 4 topics"));
    }
    if event.data.len() < 64 {
        return Err(reject(spec, event, "PoolCreated data shorter than 64 bytes"));
    }

    let token0 = address_from_topic(&event.topics[1]);
    let token1 = address_from_topic(&event.topics[2]);
    let fee = word_tail_u32(event.topics[3].as_bytes());
    let tick_spacing = word_tail_i32(&event.data[0..32]);
    let pool = Address::from_slice(&event.data[44..64]);

    let (token0, token1, was_swapped) = canonical_order(token0, token1);

    Ok(DiscoveredPool {
        pool_id: PoolId::Address(pool),
        protocol: Protocol::V3,
        variant: spec.variant.clone(),
        factory: event.address,
        token0,
        token1,
        fee: Some(fee),
        tick_spacing: Some(tick_spacing),
        stable: None,
        hooks: None,
        creation_block: event.block_number,
        was_swapped,
    })
}

fn decode_v4(spec: &ProtocolSpec, event: &RawLogEvent) -> Result<DiscoveredPool> {
    if event.topics.len() < 4 {
        return Err(reject(spec, event, "Initialize needs 4 topics"));
    }
    // fee, tick_spacing, hooks, sqrt_price, tick = five 32-byte words
    if event.data.len() < 160 {
        return Err(reject(spec, event, "Initialize data shorter than 160 bytes"));
    }

    // topic1 is the 32-byte pool id, never an address.
    let pool_id = event.topics[1];
    let token0 = address_from_topic(&event.topics[2]);
    let token1 = address_from_topic(&event.topics[3]);
    let fee = word_tail_u32(&event.data[0..32]);
    let tick_spacing = word_tail_i32(&event.data[32..64]);
    let hooks = Address::from_slice(&event.data[76..96]);

    let (token0, token1, was_swapped) = canonical_order(token0, token1);

    Ok(DiscoveredPool {
        pool_id: PoolId::Bytes32(pool_id),
        protocol: Protocol::V4,
        variant: spec.variant.clone(),
        // The emitting pool manager, not a factory.
        factory: event.address,
        token0,
        token1,
        fee: Some(fee),
        tick_spacing: Some(tick_spacing),
        stable: None,
        hooks: Some(hooks),
        creation_block: event.block_number,
        was_swapped,
    })
}

/// Restores `token0 < token1` as unsigned bytes, flagging the swap so
/// downstream consumers can correlate with the emitted order.
fn canonical_order(token0: Address, token1: Address) -> (Address, Address, bool) {
    if token0.as_bytes() > token1.as_bytes() {
        (token1, token0, true)
    } else {
        (token0, token1, false)
    }
}

fn address_from_topic(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

/// uint24/uint32 right-aligned in a 32-byte word.
fn word_tail_u32(word: &[u8]) -> u32 {
    u32::from_be_bytes([word[28], word[29], word[30], word[31]])
}

/// int24 right-aligned and sign-extended in a 32-byte word.
fn word_tail_i32(word: &[u8]) -> i32 {
    i32::from_be_bytes([word[28], word[29], word[30], word[31]])
}

fn reject(spec: &ProtocolSpec, event: &RawLogEvent, reason: &str) -> WhitelistError {
    WhitelistError::DecodeFailed(format!(
        "{} event at block {} from {:#x}: {reason}",
        spec.variant, event.block_number, event.address
    ))
}
