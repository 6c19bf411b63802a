use serde_json::{Map, Value};

/// Best-effort value for a (possibly truncated) JSON prefix.
///
/// Reveal policy: containers are closed and surfaced as soon as they open;
/// scalar leaves are suppressed until they are unambiguously complete — a
/// string until its closing quote, a number until a terminating delimiter,
/// keyword literals until fully spelled. Dangling keys and trailing commas
/// are dropped. Under this policy a longer prefix never loses a field a
/// shorter prefix surfaced.
pub fn parse_partial(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Complete documents need no repair.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let mut scanner = Scanner {
        bytes: trimmed.as_bytes(),
        pos: 0,
    };
    scanner.skip_ws();
    match scanner.parse_value() {
        Parsed::Complete(value) | Parsed::Truncated(Some(value)) => Some(value),
        Parsed::Truncated(None) | Parsed::Invalid => None,
    }
}

/// Accumulates streamed text and re-parses it after each delta, reporting
/// only changed partial values.
#[derive(Default)]
pub struct ObjectAccumulator {
    text: String,
    last: Option<Value>,
}

impl ObjectAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a delta and returns the new partial value if it changed.
    pub fn push_delta(&mut self, delta: &str) -> Option<Value> {
        self.text.push_str(delta);
        let parsed = parse_partial(&self.text)?;
        if self.last.as_ref() == Some(&parsed) {
            return None;
        }
        self.last = Some(parsed.clone());
        Some(parsed)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn latest(&self) -> Option<&Value> {
        self.last.as_ref()
    }
}

enum Parsed {
    /// The value is syntactically closed.
    Complete(Value),
    /// Input ended inside the value; `Some` carries the closeable repair,
    /// `None` means the value is suppressed until more input arrives.
    Truncated(Option<Value>),
    /// Not a prefix of valid JSON.
    Invalid,
}

enum StringParse {
    Complete(String),
    Truncated,
    Invalid,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Parsed {
        match self.peek() {
            None => Parsed::Truncated(None),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => match self.parse_string() {
                StringParse::Complete(text) => Parsed::Complete(Value::String(text)),
                StringParse::Truncated => Parsed::Truncated(None),
                StringParse::Invalid => Parsed::Invalid,
            },
            Some(b't') => self.parse_keyword("true", Value::Bool(true)),
            Some(b'f') => self.parse_keyword("false", Value::Bool(false)),
            Some(b'n') => self.parse_keyword("null", Value::Null),
            Some(byte) if byte == b'-' || byte.is_ascii_digit() => self.parse_number(),
            Some(_) => Parsed::Invalid,
        }
    }

    fn parse_object(&mut self) -> Parsed {
        self.pos += 1;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parsed::Truncated(Some(Value::Object(map))),
                Some(b'}') => {
                    self.pos += 1;
                    return Parsed::Complete(Value::Object(map));
                }
                Some(b'"') => {
                    let key = match self.parse_string() {
                        StringParse::Complete(key) => key,
                        // Truncated key: dropped.
                        StringParse::Truncated => {
                            return Parsed::Truncated(Some(Value::Object(map)))
                        }
                        StringParse::Invalid => return Parsed::Invalid,
                    };
                    self.skip_ws();
                    match self.peek() {
                        // Dangling key without a value: dropped.
                        None => return Parsed::Truncated(Some(Value::Object(map))),
                        Some(b':') => self.pos += 1,
                        Some(_) => return Parsed::Invalid,
                    }
                    self.skip_ws();
                    match self.parse_value() {
                        Parsed::Complete(value) => {
                            map.insert(key, value);
                        }
                        Parsed::Truncated(inner) => {
                            if let Some(value) = inner {
                                map.insert(key, value);
                            }
                            return Parsed::Truncated(Some(Value::Object(map)));
                        }
                        Parsed::Invalid => return Parsed::Invalid,
                    }
                    self.skip_ws();
                    match self.peek() {
                        None => return Parsed::Truncated(Some(Value::Object(map))),
                        Some(b',') => self.pos += 1,
                        Some(b'}') => {
                            self.pos += 1;
                            return Parsed::Complete(Value::Object(map));
                        }
                        Some(_) => return Parsed::Invalid,
                    }
                }
                Some(_) => return Parsed::Invalid,
            }
        }
    }

    fn parse_array(&mut self) -> Parsed {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Parsed::Truncated(Some(Value::Array(items))),
                Some(b']') => {
                    self.pos += 1;
                    return Parsed::Complete(Value::Array(items));
                }
                Some(_) => {
                    match self.parse_value() {
                        Parsed::Complete(value) => items.push(value),
                        Parsed::Truncated(inner) => {
                            if let Some(value) = inner {
                                items.push(value);
                            }
                            return Parsed::Truncated(Some(Value::Array(items)));
                        }
                        Parsed::Invalid => return Parsed::Invalid,
                    }
                    self.skip_ws();
                    match self.peek() {
                        None => return Parsed::Truncated(Some(Value::Array(items))),
                        Some(b',') => self.pos += 1,
                        Some(b']') => {
                            self.pos += 1;
                            return Parsed::Complete(Value::Array(items));
                        }
                        Some(_) => return Parsed::Invalid,
                    }
                }
            }
        }
    }

    fn parse_string(&mut self) -> StringParse {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek() {
                None => return StringParse::Truncated,
                Some(b'"') => {
                    self.pos += 1;
                    let raw = &self.bytes[start..self.pos];
                    return match serde_json::from_slice::<Value>(raw) {
                        Ok(Value::String(text)) => StringParse::Complete(text),
                        _ => StringParse::Invalid,
                    };
                }
                Some(b'\\') => {
                    self.pos += 1;
                    if self.at_end() {
                        return StringParse::Truncated;
                    }
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn parse_keyword(&mut self, keyword: &str, value: Value) -> Parsed {
        let remaining = &self.bytes[self.pos..];
        let expected = keyword.as_bytes();
        if remaining.len() >= expected.len() {
            if &remaining[..expected.len()] == expected {
                self.pos += expected.len();
                Parsed::Complete(value)
            } else {
                Parsed::Invalid
            }
        } else if expected.starts_with(remaining) {
            // Mid-keyword (`tru`): suppressed until complete.
            self.pos = self.bytes.len();
            Parsed::Truncated(None)
        } else {
            Parsed::Invalid
        }
    }

    fn parse_number(&mut self) -> Parsed {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == b'-'
                || byte == b'+'
                || byte == b'.'
                || byte == b'e'
                || byte == b'E'
                || byte.is_ascii_digit()
            {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.at_end() {
            // `1` may still grow into `12`: suppressed until delimited.
            return Parsed::Truncated(None);
        }
        match serde_json::from_slice::<Value>(&self.bytes[start..self.pos]) {
            Ok(value) => Parsed::Complete(value),
            Err(_) => Parsed::Invalid,
        }
    }
}
