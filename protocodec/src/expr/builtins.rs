//! Built-in function dispatch table.
//!
//! Functions that take node references (`#x`) need the raw node path, not a
//! resolved scalar — `bytesOf(#x)` means "the serialized bytes of node x",
//! which is not the same thing as `x`'s logical value. So dispatch here works
//! directly off the unevaluated argument [`Expr`]s: reference-shaped
//! arguments are pulled out via [`Expr::as_reference`], everything else is
//! evaluated through the caller-supplied `eval` callback.

use super::ast::Expr;
use super::time;
use crate::error::{CodecError, Stage};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::Digest;

/// Everything a builtin needs to know about the node tree it runs against.
/// Implemented by the derivation driver, backed by the finalized tree and the
/// live value map.
pub trait NodeContext {
    /// The logical value currently held by `node_path`.
    fn resolve(&self, node_path: &str) -> Result<Value, CodecError>;
    /// The node's own serialized bytes, produced by re-running the bit codec
    /// over its already-resolved value.
    fn bytes_of(&self, node_path: &str) -> Result<Vec<u8>, CodecError>;
    /// Declared bit length of a node.
    fn bit_length_of(&self, node_path: &str) -> Result<u64, CodecError>;
    /// Concatenated serialized bytes of every node in declaration order whose
    /// span falls within `[from, to]` inclusive.
    fn bytes_between(&self, from: &str, to: &str) -> Result<Vec<u8>, CodecError>;
    /// Number of materialized children of a group.
    fn group_size(&self, group_path: &str) -> Result<u64, CodecError>;
}

type Eval<'a> = dyn Fn(&Expr, &dyn NodeContext) -> Result<Value, CodecError> + 'a;

fn runtime_err(detail: impl Into<String>) -> CodecError {
    CodecError::expr_runtime(Stage::Derive, "", detail.into())
}

fn arg_ref<'e>(args: &'e [Expr], idx: usize, fn_name: &str) -> Result<&'e str, CodecError> {
    args.get(idx)
        .and_then(Expr::as_reference)
        .ok_or_else(|| runtime_err(format!("{fn_name}: argument {idx} must be a node reference")))
}

fn arg_value(
    args: &[Expr],
    idx: usize,
    fn_name: &str,
    ctx: &dyn NodeContext,
    eval: &Eval,
) -> Result<Value, CodecError> {
    let e = args
        .get(idx)
        .ok_or_else(|| runtime_err(format!("{fn_name}: missing argument {idx}")))?;
    eval(e, ctx)
}

fn arg_uint(args: &[Expr], idx: usize, fn_name: &str, ctx: &dyn NodeContext, eval: &Eval) -> Result<u64, CodecError> {
    arg_value(args, idx, fn_name, ctx, eval)?
        .as_uint()
        .ok_or_else(|| runtime_err(format!("{fn_name}: argument {idx} is not numeric")))
}

fn arg_str(args: &[Expr], idx: usize, fn_name: &str, ctx: &dyn NodeContext, eval: &Eval) -> Result<String, CodecError> {
    Ok(arg_value(args, idx, fn_name, ctx, eval)?
        .as_str()
        .ok_or_else(|| runtime_err(format!("{fn_name}: argument {idx} is not string-coercible")))?
        .into_owned())
}

fn crc16_ccitt_false(data: &[u8]) -> u16 {
    const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::Algorithm {
        width: 16,
        poly: 0x1021,
        init: 0xFFFF,
        refin: false,
        refout: false,
        xorout: 0x0000,
        check: 0x29B1,
        residue: 0x0000,
    });
    CRC16.checksum(data)
}

fn crc32_ieee(data: &[u8]) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}

pub fn call(
    name: &str,
    args: &[Expr],
    ctx: &dyn NodeContext,
    eval: &Eval,
) -> Result<Value, CodecError> {
    match name {
        "nodeLength" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::UInt(ctx.bytes_of(path)?.len() as u64))
        }
        "nodeBitLength" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::UInt(ctx.bit_length_of(path)?))
        }
        "size" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::UInt(ctx.group_size(path)?))
        }
        "bytesOf" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::Bytes(ctx.bytes_of(path)?))
        }
        "hexOf" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::Str(hex_upper(&ctx.bytes_of(path)?)))
        }
        "sliceByNodes" => {
            let from = arg_ref(args, 0, name)?;
            let to = arg_ref(args, 1, name)?;
            Ok(Value::Bytes(ctx.bytes_between(from, to)?))
        }
        "crc16Of" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::UInt(crc16_ccitt_false(&ctx.bytes_of(path)?) as u64))
        }
        "crc16Between" => {
            let from = arg_ref(args, 0, name)?;
            let to = arg_ref(args, 1, name)?;
            Ok(Value::UInt(crc16_ccitt_false(&ctx.bytes_between(from, to)?) as u64))
        }
        "crc32Of" => {
            let path = arg_ref(args, 0, name)?;
            Ok(Value::UInt(crc32_ieee(&ctx.bytes_of(path)?) as u64))
        }
        "crc32Between" => {
            let from = arg_ref(args, 0, name)?;
            let to = arg_ref(args, 1, name)?;
            Ok(Value::UInt(crc32_ieee(&ctx.bytes_between(from, to)?) as u64))
        }
        "sumBetween" => {
            let from = arg_ref(args, 0, name)?;
            let to = arg_ref(args, 1, name)?;
            let bytes = ctx.bytes_between(from, to)?;
            let sum = bytes.iter().fold(0u64, |acc, &b| (acc + b as u64) % (1u64 << 32));
            Ok(Value::UInt(sum))
        }
        "xorOf" => {
            let path = arg_ref(args, 0, name)?;
            let bytes = ctx.bytes_of(path)?;
            Ok(Value::UInt(bytes.iter().fold(0u8, |acc, &b| acc ^ b) as u64))
        }
        "hashOf" => {
            let path = arg_ref(args, 0, name)?;
            let algo = arg_str(args, 1, name, ctx, eval)?;
            let bytes = ctx.bytes_of(path)?;
            let digest = match algo.as_str() {
                "md5" => {
                    let mut h = md5::Md5::new();
                    h.update(&bytes);
                    h.finalize().to_vec()
                }
                "sha1" => {
                    let mut h = sha1::Sha1::new();
                    h.update(&bytes);
                    h.finalize().to_vec()
                }
                "sha256" => {
                    let mut h = sha2::Sha256::new();
                    h.update(&bytes);
                    h.finalize().to_vec()
                }
                other => return Err(runtime_err(format!("hashOf: unsupported algorithm '{other}'"))),
            };
            Ok(Value::Str(hex_lower(&digest)))
        }
        "asInt" => {
            let path = arg_ref(args, 0, name)?;
            let signed = arg_value(args, 1, name, ctx, eval)?.as_bool().unwrap_or(false);
            let endian = arg_str(args, 2, name, ctx, eval)?;
            let bit_off = arg_uint(args, 3, name, ctx, eval)? as usize;
            let bit_len = arg_uint(args, 4, name, ctx, eval)? as usize;
            let bytes = ctx.bytes_of(path)?;
            let raw = extract_bits_from_bytes(&bytes, bit_off, bit_len, &endian)?;
            if signed && bit_len < 64 {
                let sign_bit = 1u64 << (bit_len - 1);
                if raw & sign_bit != 0 {
                    let signed_val = (raw as i64) - (1i64 << bit_len);
                    return Ok(Value::Int(signed_val));
                }
            }
            Ok(Value::UInt(raw))
        }
        "asFloat" => {
            let path = arg_ref(args, 0, name)?;
            let endian = arg_str(args, 1, name, ctx, eval)?;
            let mut bytes = ctx.bytes_of(path)?;
            if endian.eq_ignore_ascii_case("little") {
                bytes.reverse();
            }
            match bytes.len() {
                4 => {
                    let arr: [u8; 4] = bytes.try_into().unwrap();
                    Ok(Value::Float(f32::from_be_bytes(arr) as f64))
                }
                8 => {
                    let arr: [u8; 8] = bytes.try_into().unwrap();
                    Ok(Value::Float(f64::from_be_bytes(arr)))
                }
                other => Err(runtime_err(format!("asFloat: unsupported byte width {other}"))),
            }
        }
        "extractBits" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let off = arg_uint(args, 1, name, ctx, eval)?;
            let len = arg_uint(args, 2, name, ctx, eval)?;
            let mask = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
            Ok(Value::UInt((v >> off) & mask))
        }
        "hasFlag" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let mask = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::Bool((v & mask) == mask))
        }
        "align" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let boundary = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::UInt(ceil_align(v, boundary)))
        }
        "alignPadding" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let boundary = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::UInt(ceil_align(v, boundary) - v))
        }
        "ipToHex" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let octets: Vec<u8> = s
                .split('.')
                .map(|o| o.parse::<u8>())
                .collect::<Result<_, _>>()
                .map_err(|_| runtime_err(format!("ipToHex: invalid IPv4 address '{s}'")))?;
            if octets.len() != 4 {
                return Err(runtime_err(format!("ipToHex: invalid IPv4 address '{s}'")));
            }
            Ok(Value::Str(hex_upper(&octets)))
        }
        "hexToIp" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let bytes = parse_hex_string(&s)?;
            if bytes.len() != 4 {
                return Err(runtime_err(format!("hexToIp: expected 4 bytes, got {}", bytes.len())));
            }
            Ok(Value::Str(format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])))
        }
        "macToHex" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let octets: Vec<u8> = s
                .split(':')
                .map(|o| u8::from_str_radix(o, 16))
                .collect::<Result<_, _>>()
                .map_err(|_| runtime_err(format!("macToHex: invalid MAC address '{s}'")))?;
            if octets.len() != 6 {
                return Err(runtime_err(format!("macToHex: invalid MAC address '{s}'")));
            }
            Ok(Value::Str(hex_upper(&octets)))
        }
        "hexToMac" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let bytes = parse_hex_string(&s)?;
            if bytes.len() != 6 {
                return Err(runtime_err(format!("hexToMac: expected 6 bytes, got {}", bytes.len())));
            }
            Ok(Value::Str(
                bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(":"),
            ))
        }
        "toHex" => {
            let v = arg_value(args, 0, name, ctx, eval)?;
            let bytes = v
                .as_bytes()
                .ok_or_else(|| runtime_err("toHex: argument not byte-coercible"))?;
            Ok(Value::Str(hex_upper(&bytes)))
        }
        "fromHex" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            Ok(Value::Bytes(parse_hex_string(&s)?))
        }
        "base64Encode" => {
            let v = arg_value(args, 0, name, ctx, eval)?;
            let bytes = v
                .as_bytes()
                .ok_or_else(|| runtime_err("base64Encode: argument not byte-coercible"))?;
            Ok(Value::Str(BASE64.encode(bytes)))
        }
        "base64Decode" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let bytes = BASE64
                .decode(s.as_bytes())
                .map_err(|e| runtime_err(format!("base64Decode: {e}")))?;
            Ok(Value::Bytes(bytes))
        }
        "encode" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            Ok(Value::Bytes(s.into_bytes()))
        }
        "decode" => {
            let v = arg_value(args, 0, name, ctx, eval)?;
            let bytes = v
                .as_bytes()
                .ok_or_else(|| runtime_err("decode: argument not byte-coercible"))?;
            Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        "toBCD" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            Ok(Value::Str(v.to_string()))
        }
        "fromBCD" => {
            let s = arg_str(args, 0, name, ctx, eval)?;
            let v: u64 = s
                .parse()
                .map_err(|_| runtime_err(format!("fromBCD: invalid digit string '{s}'")))?;
            Ok(Value::UInt(v))
        }
        "leftShift" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let n = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::UInt(v << n))
        }
        "rightShift" => {
            let v = arg_uint(args, 0, name, ctx, eval)?;
            let n = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::UInt(v >> n))
        }
        "relativeDay" | "relativeSecond" | "relativeMillisecond" | "relativeDayAndSecond"
        | "relativeDayAndMillisecond" | "relativeWeekAndSecond" | "relativeSecondAndMillisecond"
        | "relativeTenthMillisecond" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let ts = arg_str(args, 1, name, ctx, eval)?;
            let bytes = match name {
                "relativeDay" => time::relative_day(&base, &ts)?,
                "relativeSecond" => time::relative_second(&base, &ts)?,
                "relativeMillisecond" => time::relative_millisecond(&base, &ts)?,
                "relativeDayAndSecond" => time::relative_day_and_second(&base, &ts)?,
                "relativeDayAndMillisecond" => time::relative_day_and_millisecond(&base, &ts)?,
                "relativeWeekAndSecond" => time::relative_week_and_second(&base, &ts)?,
                "relativeSecondAndMillisecond" => time::relative_second_and_millisecond(&base, &ts)?,
                "relativeTenthMillisecond" => time::relative_tenth_millisecond(&base, &ts)?,
                _ => unreachable!(),
            };
            Ok(Value::Bytes(bytes))
        }
        "relativeDayDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_value(args, 1, name, ctx, eval)?
                .as_int()
                .ok_or_else(|| runtime_err("relativeDayDecode: encoded argument not numeric"))?;
            Ok(Value::Str(time::relative_day_decode(&base, encoded)?))
        }
        "relativeSecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::Str(time::relative_second_decode(&base, encoded)?))
        }
        "relativeMillisecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::Str(time::relative_millisecond_decode(&base, encoded)?))
        }
        "relativeDayAndSecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_value(args, 1, name, ctx, eval)?
                .as_bytes()
                .ok_or_else(|| runtime_err("relativeDayAndSecondDecode: encoded argument not byte-coercible"))?
                .into_owned();
            Ok(Value::Str(time::relative_day_and_second_decode(&base, &encoded)?))
        }
        "relativeDayAndMillisecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_value(args, 1, name, ctx, eval)?
                .as_bytes()
                .ok_or_else(|| runtime_err("relativeDayAndMillisecondDecode: encoded argument not byte-coercible"))?
                .into_owned();
            Ok(Value::Str(time::relative_day_and_millisecond_decode(&base, &encoded)?))
        }
        "relativeWeekAndSecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_value(args, 1, name, ctx, eval)?
                .as_bytes()
                .ok_or_else(|| runtime_err("relativeWeekAndSecondDecode: encoded argument not byte-coercible"))?
                .into_owned();
            Ok(Value::Str(time::relative_week_and_second_decode(&base, &encoded)?))
        }
        "relativeSecondAndMillisecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_value(args, 1, name, ctx, eval)?
                .as_bytes()
                .ok_or_else(|| runtime_err("relativeSecondAndMillisecondDecode: encoded argument not byte-coercible"))?
                .into_owned();
            Ok(Value::Str(time::relative_second_and_millisecond_decode(&base, &encoded)?))
        }
        "relativeTenthMillisecondDecode" => {
            let base = arg_str(args, 0, name, ctx, eval)?;
            let encoded = arg_uint(args, 1, name, ctx, eval)?;
            Ok(Value::Str(time::relative_tenth_millisecond_decode(&base, encoded)?))
        }
        other => Err(runtime_err(format!("unknown function '{other}'"))),
    }
}

fn ceil_align(v: u64, boundary: u64) -> u64 {
    if boundary == 0 {
        return v;
    }
    let rem = v % boundary;
    if rem == 0 {
        v
    } else {
        v + (boundary - rem)
    }
}

fn extract_bits_from_bytes(bytes: &[u8], bit_off: usize, bit_len: usize, endian: &str) -> Result<u64, CodecError> {
    let mut ordered = bytes.to_vec();
    if endian.eq_ignore_ascii_case("little") {
        ordered.reverse();
    }
    let total_bits = ordered.len() * 8;
    if bit_off + bit_len > total_bits {
        return Err(runtime_err("asInt: bit range exceeds node width"));
    }
    let mut acc = 0u64;
    for i in 0..bit_len {
        let bit_idx = bit_off + i;
        let byte = ordered[bit_idx / 8];
        let bit = (byte >> (7 - (bit_idx % 8))) & 1;
        acc = (acc << 1) | bit as u64;
    }
    Ok(acc)
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_hex_string(s: &str) -> Result<Vec<u8>, CodecError> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(runtime_err(format!("invalid hex string '{s}': odd length")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect::<Result<_, _>>()
        .map_err(|e| runtime_err(format!("invalid hex string '{s}': {e}")))
}
