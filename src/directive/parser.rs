//! Hand-written parser for the directive micro-protocol.
//!
//! Grammar (keywords are case-insensitive, `ws` is optional whitespace):
//!
//! ```text
//! db_query  := "[" ws "DB_QUERY" ws ":" body "]"
//! db_search := "[" ws "DB" ws ":" ws key(T) ws ":" ws str ws "," ws key(D) ws ":" ws str ws "]"
//! key(c)    := c | '"' c '"'
//! str       := '"' [^"]+ '"'
//! api       := "[API]" json "[/API]"
//! ```
//!
//! Anything that does not match exactly is not a directive.

use super::actions::ApiRequest;
use super::Directive;

/// Upper bound on sanitizer passes; each pass strictly shortens the text.
const MAX_SANITIZE_PASSES: usize = 16;

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(text: &'a str, pos: usize) -> Self {
        Self { text, pos }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Consume an ASCII keyword, ignoring case.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = self.rest().as_bytes();
        if rest.len() >= keyword.len()
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
        {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    /// Consume everything up to (not including) `c`.
    fn take_until(&mut self, c: char) -> Option<&'a str> {
        let rest = self.rest();
        let idx = rest.find(c)?;
        self.pos += idx;
        Some(&rest[..idx])
    }

    /// Consume a double-quoted, non-empty string.
    fn eat_quoted(&mut self) -> Option<&'a str> {
        if !self.eat('"') {
            return None;
        }
        let value = self.take_until('"')?;
        self.eat('"');
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// Consume `c` or `"c"`.
    fn eat_key(&mut self, key: &str) -> bool {
        let quoted = self.eat('"');
        if !self.eat_keyword(key) {
            return false;
        }
        !quoted || self.eat('"')
    }
}

fn bracket_positions(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.match_indices('[').map(|(i, _)| i)
}

fn db_query_at(text: &str, start: usize) -> Option<String> {
    let mut c = Cursor::at(text, start);
    if !c.eat('[') {
        return None;
    }
    c.skip_ws();
    if !c.eat_keyword("DB_QUERY") {
        return None;
    }
    c.skip_ws();
    if !c.eat(':') {
        return None;
    }
    let body = c.take_until(']')?.trim();
    if body.is_empty() {
        return None;
    }
    Some(body.to_string())
}

fn db_search_at(text: &str, start: usize) -> Option<(String, String)> {
    let mut c = Cursor::at(text, start);
    if !c.eat('[') {
        return None;
    }
    c.skip_ws();
    if !c.eat_keyword("DB") {
        return None;
    }
    c.skip_ws();
    if !c.eat(':') {
        return None;
    }
    c.skip_ws();
    if !c.eat_key("T") {
        return None;
    }
    c.skip_ws();
    if !c.eat(':') {
        return None;
    }
    c.skip_ws();
    let table = c.eat_quoted()?;
    c.skip_ws();
    if !c.eat(',') {
        return None;
    }
    c.skip_ws();
    if !c.eat_key("D") {
        return None;
    }
    c.skip_ws();
    if !c.eat(':') {
        return None;
    }
    c.skip_ws();
    let term = c.eat_quoted()?;
    c.skip_ws();
    if !c.eat(']') {
        return None;
    }
    Some((table.to_string(), term.to_string()))
}

fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let n = needle.len();
    if n == 0 || bytes.len() < n {
        return None;
    }
    (from..=bytes.len() - n).find(|&i| bytes[i..i + n].eq_ignore_ascii_case(needle.as_bytes()))
}

/// Inner text of the first `[API]...[/API]` block.
fn api_block(text: &str) -> Option<&str> {
    let open = find_ci(text, "[API]", 0)?;
    let inner_start = open + "[API]".len();
    let close = find_ci(text, "[/API]", inner_start)?;
    Some(text[inner_start..close].trim())
}

pub fn parse_db_query(text: &str) -> Option<String> {
    bracket_positions(text).find_map(|i| db_query_at(text, i))
}

pub fn parse_db_search(text: &str) -> Option<(String, String)> {
    bracket_positions(text).find_map(|i| db_search_at(text, i))
}

pub fn parse_api(text: &str) -> Option<ApiRequest> {
    let json = api_block(text)?;
    match serde_json::from_str::<ApiRequest>(json) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::debug!("Ignoring malformed [API] block: {}", e);
            None
        }
    }
}

/// Detect the first directive by fixed priority: DB query, DB search, API block.
pub fn parse(text: &str) -> Option<Directive> {
    if let Some(sql) = parse_db_query(text) {
        return Some(Directive::DbQuery { sql });
    }
    if let Some((table, term)) = parse_db_search(text) {
        return Some(Directive::DbSearch { table, term });
    }
    parse_api(text).map(Directive::ApiAction)
}

/// Byte range of the next residual fragment at or after `from`.
fn next_fragment(text: &str, from: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut consider = |range: Option<(usize, usize)>| {
        if let Some(r) = range {
            if best.map_or(true, |b| r.0 < b.0) {
                best = Some(r);
            }
        }
    };

    // [DB_QUERY ...] and [DB: ...] up to the closing bracket or end of text
    for i in bracket_positions(text).filter(|&i| i >= from) {
        let mut c = Cursor::at(text, i + 1);
        c.skip_ws();
        let is_db = c.eat_keyword("DB_QUERY") || {
            c.eat_keyword("DB") && {
                c.skip_ws();
                c.eat(':')
            }
        };
        if is_db {
            let end = text[i..].find(']').map_or(text.len(), |e| i + e + 1);
            consider(Some((i, end)));
            break;
        }
    }

    consider(paired_block(text, from, "[API]", "[/API]"));
    consider(paired_block(text, from, "[DB_RESULT]", "[/DB_RESULT]"));
    for tag in ["[API]", "[/API]", "[DB_RESULT]", "[/DB_RESULT]"] {
        consider(find_ci(text, tag, from).map(|i| (i, i + tag.len())));
    }

    if let Some(i) = text[from..].find('【').map(|i| from + i) {
        let end = text[i..].find('】').map_or(text.len(), |e| i + e + '】'.len_utf8());
        consider(Some((i, end)));
    }

    best
}

fn paired_block(text: &str, from: usize, open: &str, close: &str) -> Option<(usize, usize)> {
    let start = find_ci(text, open, from)?;
    let end = find_ci(text, close, start + open.len())?;
    Some((start, end + close.len()))
}

fn strip_once(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some((start, end)) = next_fragment(text, pos) {
        out.push_str(&text[pos..start]);
        pos = end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Remove every directive fragment and citation marker from a reply.
///
/// The result never parses as a directive.
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_SANITIZE_PASSES {
        let next = strip_once(&current);
        if next == current {
            break;
        }
        current = next;
    }

    // Removed fragments leave stacked blank lines behind; keep at most one.
    let mut lines: Vec<&str> = Vec::new();
    for line in current.lines().map(str::trim_end) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

/// Split cleaned text into chunks on blank-line boundaries.
pub fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                chunks.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n").trim().to_string());
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_query() {
        let d = parse("Checking... [DB_QUERY: SELECT 1] one moment").unwrap();
        assert_eq!(d, Directive::DbQuery { sql: "SELECT 1".to_string() });

        let d = parse("[ db_query :\n  SELECT * FROM t\n]").unwrap();
        assert_eq!(d, Directive::DbQuery { sql: "SELECT * FROM t".to_string() });

        assert!(parse("[DB_QUERY: ]").is_none());
        assert!(parse("[DB_QUERY SELECT 1]").is_none());
        assert!(parse("[DB_QUERY: SELECT 1").is_none());
    }

    #[test]
    fn test_db_search() {
        let d = parse(r#"[DB: T:"products", D:"red shoes"]"#).unwrap();
        assert_eq!(
            d,
            Directive::DbSearch {
                table: "products".to_string(),
                term: "red shoes".to_string()
            }
        );

        let d = parse(r#"[DB:"t":"clients","d":"Ana"]"#).unwrap();
        assert!(matches!(d, Directive::DbSearch { ref table, .. } if table == "clients"));

        assert!(parse(r#"[DB: T:"products"]"#).is_none());
        assert!(parse(r#"[DB: T:"", D:"x"]"#).is_none());
    }

    #[test]
    fn test_priority_order() {
        let text = r#"[API]{"type":"cancel_event","id":"e1"}[/API] [DB: T:"a", D:"b"] [DB_QUERY: SELECT 2]"#;
        assert!(matches!(parse(text), Some(Directive::DbQuery { .. })));

        let text = r#"[API]{"type":"cancel_event","id":"e1"}[/API] [DB: T:"a", D:"b"]"#;
        assert!(matches!(parse(text), Some(Directive::DbSearch { .. })));
    }

    #[test]
    fn test_api_block() {
        let text = r#"Let me check. [API] {"type": "available_event", "fecha": "2026-10-20", "hora": "15:00"} [/API]"#;
        match parse(text) {
            Some(Directive::ApiAction(ApiRequest::AvailableEvent(slot))) => {
                assert_eq!(slot.date, "2026-10-20");
                assert_eq!(slot.time, "15:00");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(parse(r#"[API]{"type":"launch_rocket"}[/API]"#).is_none());
        assert!(parse("[API] not json [/API]").is_none());
        assert!(parse(r#"[API]{"type":"cancel_event","id":"e1"}"#).is_none());
    }

    #[test]
    fn test_sanitize_removes_fragments() {
        let text = "Hello【4:0†source】 there.\n[DB_QUERY: SELECT 1]\n\n[API]{\"type\":\"x\"}[/API]Bye [DB: T:\"a\"";
        let clean = sanitize(text);
        assert_eq!(clean, "Hello there.\n\nBye");
        assert!(parse(&clean).is_none());
    }

    #[test]
    fn test_sanitize_is_idempotent_on_nested_fragments() {
        let text = "a [[API]x[/API]API]{\"type\":\"cancel_event\",\"id\":\"1\"}[/API] b";
        let clean = sanitize(text);
        assert!(parse(&clean).is_none());
        assert_eq!(sanitize(&clean), clean);
    }

    #[test]
    fn test_split_chunks() {
        let chunks = split_chunks("one\ntwo\n\n\nthree\n  \nfour");
        assert_eq!(chunks, vec!["one\ntwo", "three", "four"]);
        assert!(split_chunks("  \n\n").is_empty());
    }
}
