//! Minimal BOLT-11 amount decoding for zap-receipt accounting (C5).
//!
//! Only the amount prefix of the invoice is needed here — the Counts
//! Aggregator never validates or pays invoices, it only totals sats.

/// Decode the amount-in-satoshis encoded in a BOLT-11 invoice string's
/// human-readable part: `lnbc<amount>[<multiplier>]1<data>`. The digit
/// run is only a genuine amount if the bech32 separator `1` directly
/// follows it (or its multiplier) — otherwise the leading `1` is the
/// separator itself and the invoice carries no amount.
pub fn decode_amount_sats(invoice: &str) -> Option<u64> {
    let body = invoice.strip_prefix("lnbc").or_else(|| invoice.strip_prefix("lntb"))?;
    let digits_end = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    if digits_end == 0 {
        return None;
    }
    let amount: u128 = body[..digits_end].parse().ok()?;

    let mut rest = body[digits_end..].chars();
    let next = rest.next()?;
    let (multiplier, separator) = match next {
        'm' | 'u' | 'n' | 'p' => (Some(next), rest.next()),
        other => (None, Some(other)),
    };
    if separator != Some('1') {
        return None;
    }

    // Amount is in BTC, scaled by the multiplier; 1 BTC = 100_000_000 sats.
    let sats = match multiplier {
        Some('m') => amount * 100_000,
        Some('u') => amount * 100,
        Some('n') => amount / 10,
        Some('p') => amount / 10_000,
        None => amount * 100_000_000,
        _ => return None,
    };
    u64::try_from(sats).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_milli_btc() {
        // 1m = 0.001 BTC = 100_000 sats
        assert_eq!(decode_amount_sats("lnbc1m1p0..."), Some(100_000));
    }

    #[test]
    fn decodes_micro_btc() {
        // 500u = 0.0005 BTC = 50_000 sats
        assert_eq!(decode_amount_sats("lnbc500u1p0..."), Some(50_000));
    }

    #[test]
    fn decodes_nano_btc() {
        // 21n = 21e-9 BTC = 2.1 sats, truncated to 2
        assert_eq!(decode_amount_sats("lnbc21n1p0..."), Some(2));
    }

    #[test]
    fn decodes_literal_100u_example() {
        assert_eq!(decode_amount_sats("lnbc100u1p0..."), Some(10_000));
    }

    #[test]
    fn rejects_amountless_invoice() {
        assert_eq!(decode_amount_sats("lnbc1p0..."), None);
    }

    #[test]
    fn rejects_bare_separator_with_no_amount() {
        assert_eq!(decode_amount_sats("lnbc1qqqqqqq"), None);
    }

    #[test]
    fn rejects_non_invoice_string() {
        assert_eq!(decode_amount_sats("not-an-invoice"), None);
    }
}
