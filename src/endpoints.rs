use std::str::FromStr;

use solana_sdk::pubkey::Pubkey;

pub const PUBLIC_RPC_URLS: &[&str] = &[
    "https://api.mainnet-beta.solana.com",
    "https://solana-rpc.publicnode.com",
];

pub const JUPITER_PRICE_URL: &str = "https://lite-api.jup.ag/price/v2";
pub const JUPITER_SWAP_API_URL: &str = "https://lite-api.jup.ag/swap/v1";
pub const COINGECKO_PRICE_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD2KcCk9iDNzg4d7g3aXf1E";
pub const BONK_MINT: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";
pub const JUP_MINT: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";

pub const KNOWN_TOKENS: &[(&str, &str, u8, &str)] = &[
    ("SOL", SOL_MINT, 9, "solana"),
    ("USDC", USDC_MINT, 6, "usd-coin"),
    ("USDT", USDT_MINT, 6, "tether"),
    ("BONK", BONK_MINT, 5, "bonk"),
    ("JUP", JUP_MINT, 6, "jupiter-exchange-solana"),
];

pub const STABLE_MINTS: &[&str] = &[USDC_MINT, USDT_MINT];

pub fn symbol_for_mint(mint: &str) -> Option<&'static str> {
    KNOWN_TOKENS
        .iter()
        .find(|(_, known, _, _)| *known == mint)
        .map(|(symbol, _, _, _)| *symbol)
}

pub fn mint_for_symbol(symbol: &str) -> Option<&'static str> {
    KNOWN_TOKENS
        .iter()
        .find(|(known, _, _, _)| known.eq_ignore_ascii_case(symbol))
        .map(|(_, mint, _, _)| *mint)
}

pub fn decimals_for_mint(mint: &str) -> Option<u8> {
    KNOWN_TOKENS
        .iter()
        .find(|(_, known, _, _)| *known == mint)
        .map(|(_, _, decimals, _)| *decimals)
}

pub fn coingecko_id_for_mint(mint: &str) -> Option<&'static str> {
    KNOWN_TOKENS
        .iter()
        .find(|(_, known, _, _)| *known == mint)
        .map(|(_, _, _, id)| *id)
}

pub fn sol_mint() -> Pubkey {
    spl_token::native_mint::id()
}

pub fn parse_pubkey(value: &str) -> Option<Pubkey> {
    Pubkey::from_str(value.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_tokens_both_ways() {
        assert_eq!(mint_for_symbol("sol"), Some(SOL_MINT));
        assert_eq!(symbol_for_mint(USDC_MINT), Some("USDC"));
        assert_eq!(decimals_for_mint(BONK_MINT), Some(5));
        assert_eq!(coingecko_id_for_mint(SOL_MINT), Some("solana"));
        assert_eq!(sol_mint().to_string(), SOL_MINT);
        assert!(parse_pubkey("nope").is_none());
    }
}
