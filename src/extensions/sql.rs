//! SQL identifier checks for extension-issued statements
//!
//! Extensions may only touch tables named `ext_<id>_*`. Statements are
//! tokenized (string literals and comments skipped) and every table
//! reference after FROM / JOIN / INTO / UPDATE / TABLE / INDEX .. ON is
//! checked against the prefix. Anything that cannot be attributed to a
//! table name, like schema-qualified names, fails the check.

use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid regex"));

/// Statement kinds that are never forwarded
const FORBIDDEN_LEADING: &[&str] = &["ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX"];

/// Strict identifier check for names interpolated into DDL/DML
pub fn is_safe_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name)
}

/// Table prefix owned by an extension: `ext_<id>_` with `-` mapped to `_`
pub fn table_prefix(extension_id: &str) -> String {
    let mut prefix = String::from("ext_");
    for c in extension_id.chars() {
        if c.is_ascii_alphanumeric() {
            prefix.push(c.to_ascii_lowercase());
        } else {
            prefix.push('_');
        }
    }
    prefix.push('_');
    prefix
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Punct(char),
    Literal,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
            i += 1;
            tokens.push(Token::Literal);
        } else if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != close {
                i += 1;
            }
            tokens.push(Token::Quoted(chars[start..i.min(chars.len())].iter().collect()));
            i += 1;
        } else if c.is_alphanumeric() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }

    tokens
}

/// Split a script into statements on `;` outside literals and identifiers
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '[' => {
                    quote = Some(']');
                    current.push(c);
                }
                ';' => {
                    if !current.trim().is_empty() {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
}

/// Keywords that close a FROM list at their own nesting level
const FROM_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "UNION", "EXCEPT", "INTERSECT", "HAVING", "WINDOW",
    "RETURNING", "SET", "VALUES", "SELECT",
];

fn ends_from_list(token: &Token) -> bool {
    FROM_LIST_END.iter().any(|k| is_keyword(token, k))
}

/// Read a table reference at `i`. Returns the name (None when it is not a
/// plain identifier) and the index after it, or None for a subquery.
fn table_at(tokens: &[Token], mut i: usize) -> Option<(Option<String>, usize)> {
    // IF [NOT] EXISTS
    if tokens.get(i).map(|t| is_keyword(t, "IF")).unwrap_or(false) {
        i += 1;
        if tokens.get(i).map(|t| is_keyword(t, "NOT")).unwrap_or(false) {
            i += 1;
        }
        if tokens.get(i).map(|t| is_keyword(t, "EXISTS")).unwrap_or(false) {
            i += 1;
        }
    }
    // UPDATE OR REPLACE t
    if tokens.get(i).map(|t| is_keyword(t, "OR")).unwrap_or(false) {
        i += 2;
    }

    let name = match tokens.get(i) {
        Some(Token::Punct('(')) | None => return None,
        Some(Token::Word(w)) | Some(Token::Quoted(w)) => w.clone(),
        Some(_) => return Some((None, i + 1)),
    };

    // schema.table is not attributable to the extension
    if tokens.get(i + 1) == Some(&Token::Punct('.')) {
        return Some((None, i + 3));
    }
    Some((Some(name), i + 1))
}

/// Table names referenced by one statement. `Err` carries the offending text.
pub fn referenced_tables(statement: &str) -> Result<Vec<String>, String> {
    let tokens = tokenize(statement);
    let mut tables = Vec::new();

    if let Some(Token::Word(first)) = tokens.first() {
        if FORBIDDEN_LEADING
            .iter()
            .any(|k| first.eq_ignore_ascii_case(k))
        {
            return Err(format!("{} statements are not allowed", first.to_uppercase()));
        }
    }

    let mut i = 0;
    let mut index_pending = false;
    // one flag per parenthesis level: whether that level is inside a FROM list
    let mut from_list = vec![false];
    while i < tokens.len() {
        let token = &tokens[i];

        match token {
            Token::Punct('(') => {
                from_list.push(false);
                i += 1;
                continue;
            }
            Token::Punct(')') => {
                if from_list.len() > 1 {
                    from_list.pop();
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let in_from = from_list.last().copied().unwrap_or(false);
        if in_from && ends_from_list(token) {
            if let Some(level) = from_list.last_mut() {
                *level = false;
            }
        }

        if is_keyword(token, "INDEX") || is_keyword(token, "TRIGGER") || is_keyword(token, "VIEW")
        {
            // the object itself must carry the prefix too
            if let Some((name, next)) = table_at(&tokens, i + 1) {
                tables.push(name.ok_or_else(|| "qualified object name".to_string())?);
                index_pending = !is_keyword(token, "VIEW");
                i = next;
                continue;
            }
        }

        // CREATE INDEX name ON table / ALTER TABLE t RENAME TO name
        let on_target = index_pending && is_keyword(token, "ON");
        let rename_target = is_keyword(token, "TO")
            && i > 0
            && is_keyword(&tokens[i - 1], "RENAME");
        if on_target || rename_target {
            index_pending = false;
            if let Some((name, next)) = table_at(&tokens, i + 1) {
                tables.push(name.ok_or_else(|| "qualified table name".to_string())?);
                i = next;
                continue;
            }
        }

        // every item after a comma in a FROM list is a table, alias or not
        let opens_list = is_keyword(token, "FROM") || is_keyword(token, "JOIN");
        let list_item = in_from && *token == Token::Punct(',');
        let starts_reference = opens_list
            || list_item
            || is_keyword(token, "INTO")
            // ON CONFLICT .. DO UPDATE SET targets the statement's own table
            || (is_keyword(token, "UPDATE") && !(i > 0 && is_keyword(&tokens[i - 1], "DO")))
            || is_keyword(token, "TABLE");
        if !starts_reference {
            i += 1;
            continue;
        }
        if opens_list {
            if let Some(level) = from_list.last_mut() {
                *level = true;
            }
        }

        match table_at(&tokens, i + 1) {
            Some((name, next)) => {
                tables.push(name.ok_or_else(|| "qualified or invalid table name".to_string())?);
                i = next;
            }
            // a subquery; its parenthesis opens a new level
            None => i += 1,
        }
    }

    Ok(tables)
}

/// Check that a statement only references tables owned by `extension_id`
pub fn check_statement(extension_id: &str, statement: &str) -> Result<(), String> {
    let prefix = table_prefix(extension_id);
    for table in referenced_tables(statement)? {
        if !is_safe_identifier(&table) || !table.to_ascii_lowercase().starts_with(&prefix) {
            return Err(format!(
                "table '{}' is outside the extension's '{}*' namespace",
                table, prefix
            ));
        }
    }
    Ok(())
}
