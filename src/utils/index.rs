use bitcoin::SignedAmount;

/// Number of decimal places of one bitcoin
pub const BTC_DECIMALS: u32 = 8;

pub fn format_btc_amount(amount: SignedAmount) -> String {
    let sats = amount.to_sat();
    let sign = if sats < 0 { "-" } else { "" };
    let sats = sats.unsigned_abs();
    let unit = 10u64.pow(BTC_DECIMALS);
    format!(
        "{}{}.{:0width$} BTC",
        sign,
        sats / unit,
        sats % unit,
        width = BTC_DECIMALS as usize
    )
}
