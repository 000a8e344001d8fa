// Liquidity filter: decides whitelist membership from scraped state and a
// USD price map.
//
//   V2    exact constant-product slippage with the 0.30% fee
//   V3/V4 virtual-reserve approximation: amount0 = L / sqrtP,
//         amount1 = L * sqrtP, slippage ~= T / (2 * TVL)
//
// The V3 approximation is deliberately behind the `SlippageModel` seam so a
// cross-tick simulator can replace it without touching the filter.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use ethers::types::Address;
use log::{debug, info};

use crate::error::{Result, WhitelistError};
use crate::metrics;
use crate::settings;
use crate::types::{
    u256_to_f64_lossy, DiscoveredPool, FilterVerdict, PassType, PoolId, StateData,
};

const Q96: f64 = 79228162514264337593543950336.0; // 2^96

/// USD economics of one pool at the configured trade size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolEconomics {
    pub liquidity_usd: f64,
    pub slippage_percent: f64,
}

/// Strategy seam for the slippage computation.
pub trait SlippageModel: Send + Sync {
    /// Returns None when the state cannot support the computation (zero
    /// reserves, zero liquidity, non-positive prices).
    fn evaluate(
        &self,
        pool: &DiscoveredPool,
        state: &StateData,
        decimals: (u8, u8),
        prices: (f64, f64),
        trade_usd: f64,
    ) -> Option<PoolEconomics>;
}

/// The shipped model: exact for V2, virtual-reserve approximation for V3/V4.
pub struct VirtualReserveModel;

impl SlippageModel for VirtualReserveModel {
    fn evaluate(
        &self,
        _pool: &DiscoveredPool,
        state: &StateData,
        (decimals0, decimals1): (u8, u8),
        (price0, price1): (f64, f64),
        trade_usd: f64,
    ) -> Option<PoolEconomics> {
        if price0 <= 0.0 || price1 <= 0.0 {
            return None;
        }
        match state {
            StateData::V2 { reserve0, reserve1 } => {
                let x = u256_to_f64_lossy(*reserve0) / 10f64.powi(decimals0 as i32);
                let y = u256_to_f64_lossy(*reserve1) / 10f64.powi(decimals1 as i32);
                if x <= 0.0 || y <= 0.0 {
                    return None;
                }
                let liquidity_usd = x * price0 + y * price1;

                let dx = trade_usd / price0;
                let dy = (y * dx * 997.0) / (x * 1000.0 + dx * 997.0);
                let dy_ideal = y * dx / x;
                if dy_ideal <= 0.0 {
                    return None;
                }
                let slippage_percent = (dy_ideal - dy) / dy_ideal * 100.0;
                Some(PoolEconomics {
                    liquidity_usd,
                    slippage_percent,
                })
            }
            StateData::Slot0 {
                sqrt_price_x96,
                liquidity,
                ..
            }
            | StateData::FullTicks {
                sqrt_price_x96,
                liquidity,
                ..
            } => {
                let sqrt_price = u256_to_f64_lossy(*sqrt_price_x96) / Q96;
                if sqrt_price <= 0.0 || *liquidity == 0 {
                    return None;
                }
                let liquidity_f = *liquidity as f64;
                let amount0 = liquidity_f / sqrt_price / 10f64.powi(decimals0 as i32);
                let amount1 = liquidity_f * sqrt_price / 10f64.powi(decimals1 as i32);
                let liquidity_usd = amount0 * price0 + amount1 * price1;
                if liquidity_usd <= 0.0 {
                    return None;
                }
                let slippage_percent = trade_usd / (2.0 * liquidity_usd) * 100.0;
                Some(PoolEconomics {
                    liquidity_usd,
                    slippage_percent,
                })
            }
        }
    }
}

pub struct LiquidityFilter {
    trade_size_usd: f64,
    max_slippage_percent: f64,
    iteration_depth: u32,
    trusted: HashSet<Address>,
    model: Box<dyn SlippageModel>,
}

impl LiquidityFilter {
    pub fn from_settings(filter: &settings::Filter) -> Result<Self> {
        let mut trusted = HashSet::with_capacity(filter.trusted_tokens.len());
        for raw in &filter.trusted_tokens {
            let addr = Address::from_str(raw).map_err(|_| {
                WhitelistError::ConfigInvalid(format!("bad trusted token address '{raw}'"))
            })?;
            trusted.insert(addr);
        }
        Ok(Self {
            trade_size_usd: filter.trade_size_usd,
            max_slippage_percent: filter.max_slippage_percent,
            iteration_depth: filter.iteration_depth,
            trusted,
            model: Box::new(VirtualReserveModel),
        })
    }

    /// Additional trusted tokens loaded from the database table.
    pub fn extend_trusted(&mut self, tokens: impl IntoIterator<Item = Address>) {
        self.trusted.extend(tokens);
    }

    pub fn with_model(mut self, model: Box<dyn SlippageModel>) -> Self {
        self.model = model;
        self
    }

    /// Evaluates every pool with scraped state. Pools absent from `states`
    /// get no verdict (they were unreadable this cycle and drop out of the
    /// whitelist).
    pub fn evaluate(
        &self,
        pools: &[DiscoveredPool],
        states: &HashMap<PoolId, StateData>,
        decimals: &HashMap<Address, u8>,
        prices: &HashMap<Address, f64>,
    ) -> Vec<FilterVerdict> {
        let mut verdicts: Vec<FilterVerdict> = Vec::with_capacity(states.len());
        // Rejected-for-missing-price pools, eligible for the network-effect
        // pass. Pools that failed slippage with known prices are not.
        let mut price_starved: Vec<usize> = Vec::new();

        for pool in pools {
            let state = match states.get(&pool.pool_id) {
                Some(state) => state,
                None => continue,
            };

            // Trusted passthrough depends only on set membership.
            if self.trusted.contains(&pool.token0) || self.trusted.contains(&pool.token1) {
                metrics::increment_filter_passed("trusted");
                verdicts.push(FilterVerdict {
                    pool_id: pool.pool_id,
                    liquidity_usd: None,
                    slippage_percent: None,
                    passes: true,
                    pass_type: Some(PassType::Trusted),
                });
                continue;
            }

            let price0 = prices.get(&pool.token0).copied();
            let price1 = prices.get(&pool.token1).copied();
            let verdict = match (price0, price1) {
                (Some(p0), Some(p1)) => {
                    let d0 = decimals.get(&pool.token0).copied().unwrap_or(18);
                    let d1 = decimals.get(&pool.token1).copied().unwrap_or(18);
                    match self
                        .model
                        .evaluate(pool, state, (d0, d1), (p0, p1), self.trade_size_usd)
                    {
                        Some(economics) => {
                            let passes =
                                economics.slippage_percent <= self.max_slippage_percent;
                            if passes {
                                metrics::increment_filter_passed("slippage");
                            } else {
                                metrics::increment_filter_rejected("slippage_too_high");
                            }
                            FilterVerdict {
                                pool_id: pool.pool_id,
                                liquidity_usd: Some(economics.liquidity_usd),
                                slippage_percent: Some(economics.slippage_percent),
                                passes,
                                pass_type: passes.then_some(PassType::Slippage),
                            }
                        }
                        None => {
                            metrics::increment_filter_rejected("degenerate_state");
                            FilterVerdict {
                                pool_id: pool.pool_id,
                                liquidity_usd: None,
                                slippage_percent: None,
                                passes: false,
                                pass_type: None,
                            }
                        }
                    }
                }
                _ => {
                    metrics::increment_filter_rejected("missing_prices");
                    price_starved.push(verdicts.len());
                    FilterVerdict {
                        pool_id: pool.pool_id,
                        liquidity_usd: None,
                        slippage_percent: None,
                        passes: false,
                        pass_type: None,
                    }
                }
            };
            verdicts.push(verdict);
        }

        self.network_effect_pass(pools, &mut verdicts, &price_starved);

        let passed = verdicts.iter().filter(|v| v.passes).count();
        info!(
            "[Filter] {passed}/{} pools pass (trade ${}, max slippage {}%)",
            verdicts.len(),
            self.trade_size_usd,
            self.max_slippage_percent
        );
        verdicts
    }

    /// Bounded second pass: a price-starved pool passes once one of its
    /// tokens appears in an already-passing pool.
    fn network_effect_pass(
        &self,
        pools: &[DiscoveredPool],
        verdicts: &mut [FilterVerdict],
        price_starved: &[usize],
    ) {
        if self.iteration_depth == 0 || price_starved.is_empty() {
            return;
        }

        let pool_by_id: HashMap<PoolId, &DiscoveredPool> =
            pools.iter().map(|p| (p.pool_id, p)).collect();

        // Tokens touched by any passing pool, plus the trusted set.
        let mut covered: HashSet<Address> = self.trusted.iter().copied().collect();
        for verdict in verdicts.iter() {
            if verdict.passes {
                if let Some(pool) = pool_by_id.get(&verdict.pool_id) {
                    covered.insert(pool.token0);
                    covered.insert(pool.token1);
                }
            }
        }

        let mut pending: Vec<usize> = price_starved.to_vec();
        for depth in 1..=self.iteration_depth {
            let mut promoted_tokens: Vec<Address> = Vec::new();
            let mut still_pending = Vec::new();

            for &idx in &pending {
                let pool = match pool_by_id.get(&verdicts[idx].pool_id) {
                    Some(pool) => *pool,
                    None => continue,
                };
                if covered.contains(&pool.token0) || covered.contains(&pool.token1) {
                    metrics::increment_filter_passed("network_effect");
                    debug!(
                        "[Filter] {} passes via network effect at depth {depth}",
                        pool.pool_id
                    );
                    verdicts[idx].passes = true;
                    verdicts[idx].pass_type = Some(PassType::NetworkEffect { depth });
                    promoted_tokens.push(pool.token0);
                    promoted_tokens.push(pool.token1);
                } else {
                    still_pending.push(idx);
                }
            }

            if promoted_tokens.is_empty() {
                break;
            }
            covered.extend(promoted_tokens);
            pending = still_pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn v2_pool(n: u64, token0: Address, token1: Address) -> DiscoveredPool {
        DiscoveredPool {
            pool_id: PoolId::Address(Address::from_low_u64_be(n)),
            protocol: crate::types::Protocol::V2,
            variant: "uniswap_v2".to_string(),
            factory: Address::from_low_u64_be(0xfac),
            token0,
            token1,
            fee: Some(3000),
            tick_spacing: None,
            stable: None,
            hooks: None,
            creation_block: n,
            was_swapped: false,
        }
    }

    fn filter(trusted: Vec<Address>, depth: u32) -> LiquidityFilter {
        LiquidityFilter {
            trade_size_usd: 1000.0,
            max_slippage_percent: 5.0,
            iteration_depth: depth,
            trusted: trusted.into_iter().collect(),
            model: Box::new(VirtualReserveModel),
        }
    }

    fn token(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    // 10^(18 + extra) as U256
    fn units(amount: u64) -> U256 {
        U256::from(amount) * U256::exp10(18)
    }

    #[test]
    fn v2_slippage_matches_constant_product() {
        let model = VirtualReserveModel;
        let pool = v2_pool(1, token(1), token(2));
        // Balanced 1M/1M pool at $1/$1.
        let state = StateData::V2 {
            reserve0: units(1_000_000),
            reserve1: units(1_000_000),
        };
        let economics = model
            .evaluate(&pool, &state, (18, 18), (1.0, 1.0), 1000.0)
            .unwrap();
        assert!((economics.liquidity_usd - 2_000_000.0).abs() < 1.0);
        // $1000 into a $1M side: ~0.3% fee + ~0.1% price impact.
        assert!(economics.slippage_percent > 0.3);
        assert!(economics.slippage_percent < 0.6);

        // Direct check against the formula.
        let x = 1_000_000.0f64;
        let y = 1_000_000.0f64;
        let dx = 1000.0f64;
        let dy = (y * dx * 997.0) / (x * 1000.0 + dx * 997.0);
        let dy_ideal = y * dx / x;
        let expected = (dy_ideal - dy) / dy_ideal * 100.0;
        assert!((economics.slippage_percent - expected).abs() < 1e-9);
    }

    #[test]
    fn v2_thin_pool_fails_threshold() {
        let model = VirtualReserveModel;
        let pool = v2_pool(1, token(1), token(2));
        let state = StateData::V2 {
            reserve0: units(1_000),
            reserve1: units(1_000),
        };
        let economics = model
            .evaluate(&pool, &state, (18, 18), (1.0, 1.0), 1000.0)
            .unwrap();
        assert!(economics.slippage_percent > 5.0);
    }

    #[test]
    fn v2_zero_reserves_are_degenerate() {
        let model = VirtualReserveModel;
        let pool = v2_pool(1, token(1), token(2));
        let state = StateData::V2 {
            reserve0: U256::zero(),
            reserve1: units(1_000),
        };
        assert!(model
            .evaluate(&pool, &state, (18, 18), (1.0, 1.0), 1000.0)
            .is_none());
    }

    #[test]
    fn v3_approximation_scales_with_liquidity() {
        let model = VirtualReserveModel;
        let mut pool = v2_pool(1, token(1), token(2));
        pool.protocol = crate::types::Protocol::V3;

        // sqrtPriceX96 = 2^96 -> price 1.0; L = 1e24 gives ~1e6 virtual
        // units each side.
        let state = StateData::Slot0 {
            sqrt_price_x96: U256::from(2u128.pow(96)),
            tick: 0,
            liquidity: 1_000_000_000_000_000_000_000_000u128,
        };
        let economics = model
            .evaluate(&pool, &state, (18, 18), (1.0, 1.0), 1000.0)
            .unwrap();
        assert!((economics.liquidity_usd - 2_000_000.0).abs() < 1.0);
        let expected = 1000.0 / (2.0 * economics.liquidity_usd) * 100.0;
        assert!((economics.slippage_percent - expected).abs() < 1e-9);
        assert!(economics.slippage_percent < 5.0);

        let thin = StateData::Slot0 {
            sqrt_price_x96: U256::from(2u128.pow(96)),
            tick: 0,
            liquidity: 1_000_000_000_000_000_000u128, // ~1 unit per side
        };
        let economics = model
            .evaluate(&pool, &thin, (18, 18), (1.0, 1.0), 1000.0)
            .unwrap();
        assert!(economics.slippage_percent > 5.0);
    }

    #[test]
    fn trusted_passthrough_ignores_prices() {
        let usdc = token(0x15dc);
        let other = token(0xdead);
        let filter = filter(vec![usdc], 1);
        let pool = v2_pool(1, usdc, other);
        let states = HashMap::from([(
            pool.pool_id,
            StateData::V2 {
                reserve0: U256::zero(),
                reserve1: U256::zero(),
            },
        )]);

        // No prices, degenerate reserves: membership alone decides.
        let verdicts = filter.evaluate(&[pool], &states, &HashMap::new(), &HashMap::new());
        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].passes);
        assert_eq!(verdicts[0].pass_type, Some(PassType::Trusted));
        assert!(verdicts[0].slippage_percent.is_none());
    }

    #[test]
    fn missing_prices_reject_without_trusted_token() {
        let filter = filter(vec![], 0);
        let pool = v2_pool(1, token(1), token(2));
        let states = HashMap::from([(
            pool.pool_id,
            StateData::V2 {
                reserve0: units(1_000_000),
                reserve1: units(1_000_000),
            },
        )]);
        let verdicts = filter.evaluate(&[pool], &states, &HashMap::new(), &HashMap::new());
        assert!(!verdicts[0].passes);
        assert!(verdicts[0].pass_type.is_none());
    }

    #[test]
    fn network_effect_promotes_connected_pools() {
        let (a, b, c, d) = (token(1), token(2), token(3), token(4));
        let filter = filter(vec![], 2);

        // Pool 1 (a,b) has prices and deep liquidity. Pool 2 (b,c) lacks c's
        // price; pool 3 (c,d) is two hops out.
        let pool1 = v2_pool(1, a, b);
        let pool2 = v2_pool(2, b, c);
        let pool3 = v2_pool(3, c, d);

        let deep = StateData::V2 {
            reserve0: units(1_000_000),
            reserve1: units(1_000_000),
        };
        let states = HashMap::from([
            (pool1.pool_id, deep.clone()),
            (pool2.pool_id, deep.clone()),
            (pool3.pool_id, deep.clone()),
        ]);
        let prices = HashMap::from([(a, 1.0), (b, 1.0)]);

        let verdicts = filter.evaluate(
            &[pool1, pool2, pool3],
            &states,
            &HashMap::new(),
            &prices,
        );
        assert!(verdicts[0].passes);
        assert_eq!(verdicts[0].pass_type, Some(PassType::Slippage));
        assert_eq!(
            verdicts[1].pass_type,
            Some(PassType::NetworkEffect { depth: 1 })
        );
        assert_eq!(
            verdicts[2].pass_type,
            Some(PassType::NetworkEffect { depth: 2 })
        );
    }

    #[test]
    fn network_effect_bounded_by_iteration_depth() {
        let (a, b, c, d) = (token(1), token(2), token(3), token(4));
        let filter = filter(vec![], 1);

        let pool1 = v2_pool(1, a, b);
        let pool2 = v2_pool(2, b, c);
        let pool3 = v2_pool(3, c, d);

        let deep = StateData::V2 {
            reserve0: units(1_000_000),
            reserve1: units(1_000_000),
        };
        let states = HashMap::from([
            (pool1.pool_id, deep.clone()),
            (pool2.pool_id, deep.clone()),
            (pool3.pool_id, deep.clone()),
        ]);
        let prices = HashMap::from([(a, 1.0), (b, 1.0)]);

        let verdicts = filter.evaluate(
            &[pool1, pool2, pool3],
            &states,
            &HashMap::new(),
            &prices,
        );
        assert!(verdicts[1].passes);
        assert!(!verdicts[2].passes);
    }

    #[test]
    fn slippage_failures_are_not_rescued_by_network_effect() {
        let (a, b) = (token(1), token(2));
        let filter = filter(vec![], 3);

        // Deep pool passes; thin pool on the same tokens fails slippage and
        // must stay failed even though its tokens are covered.
        let deep_pool = v2_pool(1, a, b);
        let thin_pool = v2_pool(2, a, b);
        let states = HashMap::from([
            (
                deep_pool.pool_id,
                StateData::V2 {
                    reserve0: units(1_000_000),
                    reserve1: units(1_000_000),
                },
            ),
            (
                thin_pool.pool_id,
                StateData::V2 {
                    reserve0: units(100),
                    reserve1: units(100),
                },
            ),
        ]);
        let prices = HashMap::from([(a, 1.0), (b, 1.0)]);

        let verdicts = filter.evaluate(
            &[deep_pool, thin_pool],
            &states,
            &HashMap::new(),
            &prices,
        );
        assert!(verdicts[0].passes);
        assert!(!verdicts[1].passes);
        assert!(verdicts[1].slippage_percent.unwrap() > 5.0);
    }

    #[test]
    fn pools_without_state_get_no_verdict() {
        let filter = filter(vec![], 1);
        let pool = v2_pool(1, token(1), token(2));
        let verdicts = filter.evaluate(&[pool], &HashMap::new(), &HashMap::new(), &HashMap::new());
        assert!(verdicts.is_empty());
    }
}
