// =============================================================================
// Wire Codec — length-delimited tag-wire binary format
// =============================================================================
//
// Every field is prefixed by a tag: `(field_number << 3) | wire_type`, itself
// encoded as a varint (single byte for field numbers 1-15; the schemas below
// stay <= 13). Wire types:
//
//   0  varint          — unsigned 7-bit groups, least-significant first,
//                        high bit = continuation. Signed values are cast
//                        through two's complement (int64 semantics).
//   1  fixed 64-bit    — IEEE-754 binary64, little-endian.
//   2  length-delimited — varint byte length, then UTF-8 bytes.
//
// Zero-valued scalars and empty strings are omitted on encode; decoders treat
// absent fields as their zero value. Unknown field numbers are skipped by
// wire type so old readers survive schema growth; unknown wire types and
// fields running past the buffer end are malformed.
//
// Field numbers:
//   Order      (1)order_id (2)strategy_id (3)symbol (4)price (5)volume
//              (6)side (7)timestamp
//   Trade      (1)trade_id (2)order_id (3)strategy_id (4)symbol (5)side
//              (6)filled_price (7)filled_volume (8)trade_time (9)status
//              (10)error_code (11)error_message (12)is_retryable
//              (13)commission
//   MarketData (1)symbol (2)last_price (3)volume (4)exchange_time
//              (5)local_time (6)exchange
// =============================================================================

use crate::error::EngineError;
use crate::types::{MarketData, Order, Side, Trade, TradeStatus};

type Result<T> = std::result::Result<T, EngineError>;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn tag(&mut self, field: u32, wire_type: u8) {
        self.raw_varint(((field << 3) | wire_type as u32) as u64);
    }

    fn raw_varint(&mut self, mut value: u64) {
        while value > 0x7f {
            self.buf.push((value & 0x7f) as u8 | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Signed varint via two's complement (protobuf int64 semantics).
    fn varint(&mut self, field: u32, value: i64) {
        if value == 0 {
            return;
        }
        self.tag(field, WIRE_VARINT);
        self.raw_varint(value as u64);
    }

    fn double(&mut self, field: u32, value: f64) {
        if value == 0.0 {
            return;
        }
        self.tag(field, WIRE_FIXED64);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, field: u32, value: &str) {
        if value.is_empty() {
            return;
        }
        self.tag(field, WIRE_LEN);
        self.raw_varint(value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn boolean(&mut self, field: u32, value: bool) {
        self.varint(field, value as i64);
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// One decoded field value.
enum Value<'a> {
    Varint(u64),
    Double(f64),
    Str(&'a str),
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn malformed(msg: impl Into<String>) -> EngineError {
        EngineError::DecodeMalformed(msg.into())
    }

    fn raw_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| Self::malformed("varint runs past buffer end"))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(Self::malformed("varint longer than 64 bits"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read the next `(field_number, value)` pair, or `None` at end of buffer.
    fn next_field(&mut self) -> Result<Option<(u32, Value<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.raw_varint()?;
        let field = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        let value = match wire_type {
            WIRE_VARINT => Value::Varint(self.raw_varint()?),
            WIRE_FIXED64 => {
                let end = self.pos + 8;
                let bytes = self
                    .buf
                    .get(self.pos..end)
                    .ok_or_else(|| Self::malformed("fixed64 runs past buffer end"))?;
                self.pos = end;
                Value::Double(f64::from_le_bytes(bytes.try_into().unwrap()))
            }
            WIRE_LEN => {
                let len = self.raw_varint()? as usize;
                let end = self
                    .pos
                    .checked_add(len)
                    .ok_or_else(|| Self::malformed("length-delimited field overflows"))?;
                let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
                    Self::malformed("length-delimited field runs past buffer end")
                })?;
                self.pos = end;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Self::malformed("length-delimited field is not UTF-8"))?;
                Value::Str(s)
            }
            other => return Err(Self::malformed(format!("unknown wire type: {other}"))),
        };

        Ok(Some((field, value)))
    }
}

fn parse_side(s: &str) -> Result<Side> {
    Side::parse(s).ok_or_else(|| EngineError::DecodeMalformed(format!("unknown side: {s:?}")))
}

fn parse_status(s: &str) -> Result<TradeStatus> {
    TradeStatus::parse(s)
        .ok_or_else(|| EngineError::DecodeMalformed(format!("unknown trade status: {s:?}")))
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

pub fn encode_order(order: &Order) -> Vec<u8> {
    let mut w = Writer::default();
    w.string(1, &order.order_id);
    w.string(2, &order.strategy_id);
    w.string(3, &order.symbol);
    w.double(4, order.price);
    w.varint(5, order.volume);
    w.string(6, order.side.as_str());
    w.varint(7, order.timestamp);
    w.buf
}

pub fn decode_order(buf: &[u8]) -> Result<Order> {
    let mut r = Reader::new(buf);
    let mut order_id = String::new();
    let mut strategy_id = String::new();
    let mut symbol = String::new();
    let mut price = 0.0;
    let mut volume = 0i64;
    let mut side = String::new();
    let mut timestamp = 0i64;

    while let Some((field, value)) = r.next_field()? {
        match (field, value) {
            (1, Value::Str(s)) => order_id = s.to_string(),
            (2, Value::Str(s)) => strategy_id = s.to_string(),
            (3, Value::Str(s)) => symbol = s.to_string(),
            (4, Value::Double(v)) => price = v,
            (5, Value::Varint(v)) => volume = v as i64,
            (6, Value::Str(s)) => side = s.to_string(),
            (7, Value::Varint(v)) => timestamp = v as i64,
            // Unknown field numbers (and type-mismatched known ones) are
            // skipped for forward compatibility.
            _ => {}
        }
    }

    Ok(Order {
        order_id,
        strategy_id,
        symbol,
        price,
        volume,
        side: parse_side(&side)?,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

pub fn encode_trade(trade: &Trade) -> Vec<u8> {
    let mut w = Writer::default();
    w.string(1, &trade.trade_id);
    w.string(2, &trade.order_id);
    w.string(3, &trade.strategy_id);
    w.string(4, &trade.symbol);
    w.string(5, trade.side.as_str());
    w.double(6, trade.filled_price);
    w.varint(7, trade.filled_volume);
    w.varint(8, trade.trade_time);
    w.string(9, trade.status.as_str());
    w.varint(10, trade.error_code);
    w.string(11, &trade.error_message);
    w.boolean(12, trade.is_retryable);
    w.double(13, trade.commission);
    w.buf
}

pub fn decode_trade(buf: &[u8]) -> Result<Trade> {
    let mut r = Reader::new(buf);
    let mut trade_id = String::new();
    let mut order_id = String::new();
    let mut strategy_id = String::new();
    let mut symbol = String::new();
    let mut side = String::new();
    let mut filled_price = 0.0;
    let mut filled_volume = 0i64;
    let mut trade_time = 0i64;
    let mut status = String::new();
    let mut error_code = 0i64;
    let mut error_message = String::new();
    let mut is_retryable = false;
    let mut commission = 0.0;

    while let Some((field, value)) = r.next_field()? {
        match (field, value) {
            (1, Value::Str(s)) => trade_id = s.to_string(),
            (2, Value::Str(s)) => order_id = s.to_string(),
            (3, Value::Str(s)) => strategy_id = s.to_string(),
            (4, Value::Str(s)) => symbol = s.to_string(),
            (5, Value::Str(s)) => side = s.to_string(),
            (6, Value::Double(v)) => filled_price = v,
            (7, Value::Varint(v)) => filled_volume = v as i64,
            (8, Value::Varint(v)) => trade_time = v as i64,
            (9, Value::Str(s)) => status = s.to_string(),
            (10, Value::Varint(v)) => error_code = v as i64,
            (11, Value::Str(s)) => error_message = s.to_string(),
            (12, Value::Varint(v)) => is_retryable = v != 0,
            (13, Value::Double(v)) => commission = v,
            _ => {}
        }
    }

    Ok(Trade {
        trade_id,
        order_id,
        strategy_id,
        symbol,
        side: parse_side(&side)?,
        filled_price,
        filled_volume,
        trade_time,
        status: parse_status(&status)?,
        error_code,
        error_message,
        is_retryable,
        commission,
    })
}

// ---------------------------------------------------------------------------
// MarketData
// ---------------------------------------------------------------------------

pub fn encode_market_data(md: &MarketData) -> Vec<u8> {
    let mut w = Writer::default();
    w.string(1, &md.symbol);
    w.double(2, md.last_price);
    w.double(3, md.volume);
    w.varint(4, md.exchange_time);
    w.varint(5, md.local_time);
    w.string(6, &md.exchange);
    w.buf
}

pub fn decode_market_data(buf: &[u8]) -> Result<MarketData> {
    let mut r = Reader::new(buf);
    let mut md = MarketData {
        symbol: String::new(),
        last_price: 0.0,
        volume: 0.0,
        exchange_time: 0,
        local_time: 0,
        exchange: String::new(),
    };

    while let Some((field, value)) = r.next_field()? {
        match (field, value) {
            (1, Value::Str(s)) => md.symbol = s.to_string(),
            (2, Value::Double(v)) => md.last_price = v,
            (3, Value::Double(v)) => md.volume = v,
            (4, Value::Varint(v)) => md.exchange_time = v as i64,
            (5, Value::Varint(v)) => md.local_time = v as i64,
            (6, Value::Str(s)) => md.exchange = s.to_string(),
            _ => {}
        }
    }

    Ok(md)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order {
            order_id: "ORDER_123".to_string(),
            strategy_id: "s".to_string(),
            symbol: "BTCUSDT".to_string(),
            price: 50000.0,
            volume: 1,
            side: Side::Buy,
            timestamp: 1_234_567_890_000_000_000,
        }
    }

    fn sample_trade() -> Trade {
        Trade {
            trade_id: "T1".to_string(),
            order_id: "ORDER_123".to_string(),
            strategy_id: "s".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            filled_price: 49999.5,
            filled_volume: 2,
            trade_time: 1_234_567_890_000_000_123,
            status: TradeStatus::Filled,
            error_code: 0,
            error_message: String::new(),
            is_retryable: false,
            commission: 1.25,
        }
    }

    // ---- round trips -------------------------------------------------------

    #[test]
    fn order_roundtrip() {
        let order = sample_order();
        let decoded = decode_order(&encode_order(&order)).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn trade_roundtrip() {
        let trade = sample_trade();
        let decoded = decode_trade(&encode_trade(&trade)).unwrap();
        assert_eq!(decoded, trade);
    }

    #[test]
    fn trade_roundtrip_rejection() {
        let mut trade = sample_trade();
        trade.status = TradeStatus::Rejected;
        trade.filled_price = 0.0;
        trade.filled_volume = 0;
        trade.error_code = 1001;
        trade.error_message = "Simulated rejection".to_string();
        trade.is_retryable = true;
        trade.commission = 0.0;
        let decoded = decode_trade(&encode_trade(&trade)).unwrap();
        assert_eq!(decoded, trade);
    }

    #[test]
    fn market_data_roundtrip() {
        let md = MarketData {
            symbol: "ETHUSDT".to_string(),
            last_price: 1875.42,
            volume: 12.5,
            exchange_time: 1_700_000_000_000_000_000,
            local_time: 1_700_000_000_000_000_500,
            exchange: "binance".to_string(),
        };
        let decoded = decode_market_data(&encode_market_data(&md)).unwrap();
        assert_eq!(decoded, md);
    }

    // ---- byte layout -------------------------------------------------------

    #[test]
    fn market_data_known_bytes() {
        // field 1 "A" | field 2 double 1.5 | field 4 varint 1; fields with
        // zero values are omitted entirely.
        let md = MarketData {
            symbol: "A".to_string(),
            last_price: 1.5,
            volume: 0.0,
            exchange_time: 1,
            local_time: 0,
            exchange: String::new(),
        };
        let bytes = encode_market_data(&md);
        let expected: Vec<u8> = vec![
            0x0a, 0x01, 0x41, // (1 << 3) | 2, len 1, "A"
            0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf8, 0x3f, // (2 << 3) | 1, 1.5 LE
            0x20, 0x01, // (4 << 3) | 0, varint 1
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn multibyte_varint() {
        let mut w = Writer::default();
        w.raw_varint(300);
        assert_eq!(w.buf, vec![0xac, 0x02]);

        let mut r = Reader::new(&w.buf);
        assert_eq!(r.raw_varint().unwrap(), 300);
    }

    #[test]
    fn zero_fields_collapse_to_defaults() {
        let md = MarketData {
            symbol: "X".to_string(),
            last_price: 0.0,
            volume: 0.0,
            exchange_time: 0,
            local_time: 0,
            exchange: String::new(),
        };
        let decoded = decode_market_data(&encode_market_data(&md)).unwrap();
        assert_eq!(decoded, md);
    }

    // ---- forward compatibility & malformed input ---------------------------

    #[test]
    fn unknown_fields_are_skipped() {
        let mut bytes = encode_order(&sample_order());
        // Append field 15 (varint) and field 14 (string) — future schema.
        bytes.extend_from_slice(&[(15 << 3) | 0, 0x2a]);
        bytes.extend_from_slice(&[(14 << 3) | 2, 0x02, b'h', b'i']);
        let decoded = decode_order(&bytes).unwrap();
        assert_eq!(decoded, sample_order());
    }

    #[test]
    fn unknown_wire_type_is_malformed() {
        // wire type 5 does not exist
        let bytes = vec![(1 << 3) | 5, 0x00];
        let err = decode_market_data(&bytes).unwrap_err();
        assert!(matches!(err, EngineError::DecodeMalformed(_)));
    }

    #[test]
    fn truncated_length_delimited_is_malformed() {
        // claims 10 bytes of payload, provides 2
        let bytes = vec![(1 << 3) | 2, 0x0a, b'a', b'b'];
        let err = decode_market_data(&bytes).unwrap_err();
        assert!(matches!(err, EngineError::DecodeMalformed(_)));
    }

    #[test]
    fn truncated_double_is_malformed() {
        let bytes = vec![(2 << 3) | 1, 0x00, 0x00];
        let err = decode_market_data(&bytes).unwrap_err();
        assert!(matches!(err, EngineError::DecodeMalformed(_)));
    }

    #[test]
    fn missing_side_is_malformed() {
        // An order frame without a side cannot be interpreted.
        let mut order = sample_order();
        order.order_id = String::new();
        let mut w = Writer::default();
        w.string(3, &order.symbol);
        w.double(4, order.price);
        let err = decode_order(&w.buf).unwrap_err();
        assert!(matches!(err, EngineError::DecodeMalformed(_)));
    }
}
