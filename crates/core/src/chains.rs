//! Chain-name normalisation
//!
//! Aggregators name the same chain differently ("evm:56", "bsc",
//! "BNB Smart Chain"). Metric labels always use one canonical name.

/// Canonical name for every alias we know, matched case-insensitively
const CHAIN_ALIASES: &[(&str, &str)] = &[
    ("solana", "solana"),
    ("sol", "solana"),
    ("solana:solana", "solana"),
    ("evm:1399811149", "solana"),
    ("bnb", "bnb"),
    ("bsc", "bnb"),
    ("bnb chain", "bnb"),
    ("bnb smart chain", "bnb"),
    ("binance smart chain", "bnb"),
    ("evm:56", "bnb"),
    ("base", "base"),
    ("evm:8453", "base"),
    ("ethereum", "ethereum"),
    ("eth", "ethereum"),
    ("evm:1", "ethereum"),
    ("monad", "monad"),
    ("evm:143", "monad"),
];

/// Map an aggregator chain code to its canonical name.
///
/// Unknown codes are returned unchanged so they stay visible in the metrics.
pub fn normalize_chain(code: &str) -> String {
    let trimmed = code.trim();
    CHAIN_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| code.to_string())
}
