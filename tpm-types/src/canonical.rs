// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! JSON Canonicalization Scheme (RFC 8785) over `serde_json` values

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Number, Value};

/// Serialize `value` to its RFC 8785 canonical form.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("failed to convert to JSON value")?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // keys are ordered by their UTF-16 code units
            let mut entries: Vec<(Vec<u16>, &String, &Value)> = map
                .iter()
                .map(|(k, v)| (k.encode_utf16().collect(), k, v))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('{');
            for (i, (_, key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &Number, out: &mut String) -> Result<()> {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return Ok(());
    }
    let f = n.as_f64().context("non-finite number")?;
    out.push_str(&es_number(f));
    Ok(())
}

/// ECMAScript `Number.prototype.toString` of a finite double
fn es_number(f: f64) -> String {
    if f == 0.0 {
        return "0".into();
    }
    // shortest round-trip digits, as `d.ddde<exp>`
    let sci = format!("{:e}", f.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exp.parse::<i32>().unwrap_or(0) + 1;

    let mut out = String::new();
    if f < 0.0 {
        out.push('-');
    }
    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat('0').take((n - k) as usize));
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take(-n as usize));
        out.push_str(&digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        out.push('e');
        out.push(if n > 0 { '+' } else { '-' });
        out.push_str(&(n - 1).abs().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_strips_whitespace() {
        let value = json!({
            "z": "x",
            "a": 1,
            "m": { "b": [true, null], "a": -2.0 },
        });
        insta::assert_snapshot!(
            to_canonical_json(&value).unwrap(),
            @r#"{"a":1,"m":{"a":-2,"b":[true,null]},"z":"x"}"#
        );
    }

    #[test]
    fn escapes_like_json() {
        let value = json!({ "k": "line\nbreak \"quoted\" \u{1}" });
        assert_eq!(
            to_canonical_json(&value).unwrap(),
            r#"{"k":"line\nbreak \"quoted\" \u0001"}"#
        );
    }

    #[test]
    fn numbers_print_like_ecmascript() {
        let value = json!([1e21, 1e-7, 1.5, 123456789012345680000.0, -0.0, 0.000001, 1.25e-9, -3e30]);
        assert_eq!(
            to_canonical_json(&value).unwrap(),
            "[1e+21,1e-7,1.5,123456789012345680000,0,0.000001,1.25e-9,-3e+30]"
        );
        assert_eq!(es_number(333333333.3333333), "333333333.3333333");
        assert_eq!(es_number(-1.0), "-1");
    }
}
