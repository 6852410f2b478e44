//! The binary wire codec for PostgreSQL `NUMERIC`.
//!
//! Wire layout: `ndigits:i16, weight:i16, sign:u16, dscale:u16` followed by
//! `ndigits` base-10000 digit groups (i16, most significant first). The
//! value is `Σ group[i] * 10000^(weight - i)`, with `dscale` base-10 digits
//! after the decimal point.

use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::BigDecimal;
use bytes::{BufMut, BytesMut};
use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Sync + Send>;

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

pub(crate) fn encode(decimal: &BigDecimal, out: &mut BytesMut) -> Result<(), BoxError> {
    let (bigint, exponent) = decimal.as_bigint_and_exponent();
    let sign = match bigint.sign() {
        Sign::Minus => SIGN_NEGATIVE,
        _ => SIGN_POSITIVE,
    };

    let mut digits = bigint.magnitude().to_string();
    let mut scale = exponent;

    // A negative exponent means trailing integer zeros.
    if scale < 0 {
        digits.extend(std::iter::repeat('0').take((-scale) as usize));
        scale = 0;
    }

    let dscale = u16::try_from(scale).map_err(|_| "numeric scale out of range")?;

    if digits == "0" {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(SIGN_POSITIVE);
        out.put_u16(dscale);
        return Ok(());
    }

    let integer_len = digits.len() as i64 - scale;

    // Align both ends to base-10000 group boundaries.
    let left_pad = (integer_len.rem_euclid(4).wrapping_neg()).rem_euclid(4) as usize;
    let right_pad = ((scale.rem_euclid(4)).wrapping_neg()).rem_euclid(4) as usize;

    let padded: String = "0".repeat(left_pad) + &digits + &"0".repeat(right_pad);

    let mut groups: Vec<i16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .expect("digits are ascii")
                .parse::<i16>()
                .expect("4 decimal digits fit i16")
        })
        .collect();

    let mut weight = ((integer_len + left_pad as i64) / 4 - 1) as i64;

    // Normalize: postgres does not store leading or trailing zero groups.
    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }

    out.put_i16(i16::try_from(groups.len()).map_err(|_| "numeric has too many digits")?);
    out.put_i16(i16::try_from(weight).map_err(|_| "numeric weight out of range")?);
    out.put_u16(sign);
    out.put_u16(dscale);
    for group in groups {
        out.put_i16(group);
    }

    Ok(())
}

pub(crate) fn decode(raw: &[u8]) -> Result<BigDecimal, BoxError> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }

    let ndigits = i16::from_be_bytes([raw[0], raw[1]]);
    let weight = i16::from_be_bytes([raw[2], raw[3]]);
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]);

    if sign == SIGN_NAN {
        return Err("numeric NaN has no decimal representation".into());
    }

    let expected = 8 + ndigits as usize * 2;
    if raw.len() < expected {
        return Err("numeric digit groups truncated".into());
    }

    let mut unsigned = BigInt::from(0u8);
    for i in 0..ndigits as usize {
        let offset = 8 + i * 2;
        let group = i16::from_be_bytes([raw[offset], raw[offset + 1]]);
        unsigned = unsigned * 10_000 + group;
    }

    // Scale of the raw digit string: groups after the decimal point × 4.
    let group_scale = (i64::from(ndigits) - i64::from(weight) - 1) * 4;

    let signed = if sign == SIGN_NEGATIVE { -unsigned } else { unsigned };

    let decimal = BigDecimal::new(signed, group_scale).with_scale(i64::from(dscale));
    Ok(decimal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn round_trip(input: &str) {
        let decimal = BigDecimal::from_str(input).unwrap();
        let mut buf = BytesMut::new();
        encode(&decimal, &mut buf).unwrap();
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, decimal, "round-tripping {input}");
    }

    #[test]
    fn round_trips_representative_values() {
        for input in [
            "0",
            "1",
            "-1",
            "42",
            "12345.6789",
            "-12345.6789",
            "0.00001",
            "10000",
            "9999.9999",
            "123456789012345678901234567890.123456789",
            "-0.5",
            "1000000",
            "0.1",
        ] {
            round_trip(input);
        }
    }

    #[test]
    fn zero_with_scale_keeps_its_scale() {
        let decimal = BigDecimal::from_str("0.00").unwrap();
        let mut buf = BytesMut::new();
        encode(&decimal, &mut buf).unwrap();
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded, decimal);
    }

    #[test]
    fn rejects_nan() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_u16(SIGN_NAN);
        buf.put_u16(0);
        assert!(decode(&buf).is_err());
    }
}
