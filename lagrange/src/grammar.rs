//! Lightweight SQL classification for live-query matching.
//!
//! A full parse is not needed to decide which live queries a write can
//! affect: the statement kind and the set of columns it names are enough.
//! Both come from the token stream, so statements the parser would reject
//! (vendor extensions, SQLite-only syntax) still classify.

use std::collections::BTreeSet;
use std::fmt;

use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError, Word};

/// What a statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Create,
    Drop,
    Alter,
    Other,
}

impl StatementKind {
    /// Whether the statement changes rows.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Replace)
    }
}

/// The parts of a statement relevant to live queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub kind: StatementKind,
    /// Lowercased column names the statement references.
    pub columns: BTreeSet<String>,
    /// The statement may touch every column (`INSERT` without a column
    /// list, `DELETE` without `WHERE`).
    pub all_columns: bool,
}

impl ParsedStatement {
    /// Whether the statement may affect any of `columns`.
    #[must_use]
    pub fn touches_any<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> bool {
        let mut columns = columns.into_iter().peekable();
        if self.all_columns {
            return columns.peek().is_some();
        }
        columns.any(|column| self.columns.contains(&column.to_lowercase()))
    }
}

/// Classifies SQL statements.
pub trait StatementGrammar: Send + Sync + fmt::Debug {
    fn parse(&self, sql: &str) -> Result<ParsedStatement, GrammarError>;
}

/// [`StatementGrammar`] over the SQLite tokenizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlGrammar;

impl StatementGrammar for SqlGrammar {
    fn parse(&self, sql: &str) -> Result<ParsedStatement, GrammarError> {
        let tokens: Vec<Token> = Tokenizer::new(&SQLiteDialect {}, sql)
            .tokenize()?
            .into_iter()
            .filter(|token| !matches!(token, Token::Whitespace(_)))
            .collect();

        let kind = match tokens.first() {
            Some(Token::Word(word)) => kind_of(word),
            Some(_) => StatementKind::Other,
            None => return Err(GrammarError::Empty),
        };

        let mut columns = BTreeSet::new();
        for (i, token) in tokens.iter().enumerate() {
            if is_comparison(token)
                && let Some(column) = column_before(&tokens[..i])
            {
                columns.insert(column);
            }
        }

        let mut all_columns = false;
        match kind {
            StatementKind::Insert | StatementKind::Replace => match insert_columns(&tokens) {
                Some(listed) => columns.extend(listed),
                None => all_columns = true,
            },
            StatementKind::Delete => {
                all_columns = !tokens.iter().any(|token| is_keyword(token, Keyword::WHERE));
            }
            _ => {}
        }

        Ok(ParsedStatement {
            kind,
            columns,
            all_columns,
        })
    }
}

fn kind_of(word: &Word) -> StatementKind {
    match word.keyword {
        Keyword::SELECT | Keyword::WITH => StatementKind::Select,
        Keyword::INSERT => StatementKind::Insert,
        Keyword::UPDATE => StatementKind::Update,
        Keyword::DELETE => StatementKind::Delete,
        Keyword::REPLACE => StatementKind::Replace,
        Keyword::CREATE => StatementKind::Create,
        Keyword::DROP => StatementKind::Drop,
        Keyword::ALTER => StatementKind::Alter,
        _ => StatementKind::Other,
    }
}

fn is_keyword(token: &Token, keyword: Keyword) -> bool {
    matches!(token, Token::Word(word) if word.keyword == keyword && word.quote_style.is_none())
}

fn is_comparison(token: &Token) -> bool {
    matches!(
        token,
        Token::Eq | Token::DoubleEq | Token::Neq | Token::Lt | Token::Gt | Token::LtEq | Token::GtEq
    ) || [Keyword::IN, Keyword::LIKE, Keyword::IS, Keyword::BETWEEN]
        .into_iter()
        .any(|keyword| is_keyword(token, keyword))
}

/// The identifier directly left of a comparison, skipping a `NOT`.
fn column_before(tokens: &[Token]) -> Option<String> {
    let mut preceding = tokens.iter().rev();
    let mut token = preceding.next()?;
    if is_keyword(token, Keyword::NOT) {
        token = preceding.next()?;
    }
    match token {
        Token::Word(word) => Some(word.value.to_lowercase()),
        _ => None,
    }
}

/// Columns listed after `INTO table`, or `None` when there is no list.
fn insert_columns(tokens: &[Token]) -> Option<Vec<String>> {
    let into = tokens.iter().position(|token| is_keyword(token, Keyword::INTO))?;
    let mut rest = tokens[into + 1..].iter().peekable();

    // Table name, possibly qualified.
    rest.next()?;
    while matches!(rest.peek(), Some(Token::Period)) {
        rest.next();
        rest.next();
    }

    if !matches!(rest.next(), Some(Token::LParen)) {
        return None;
    }
    let mut columns = Vec::new();
    for token in rest {
        match token {
            Token::RParen => return Some(columns),
            Token::Word(word) => columns.push(word.value.to_lowercase()),
            _ => {}
        }
    }
    None
}

/// Error returned for statements that cannot be classified.
#[derive(Debug)]
pub enum GrammarError {
    /// The statement has no tokens.
    Empty,
    Tokenize(TokenizerError),
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty statement"),
            Self::Tokenize(e) => write!(f, "cannot tokenize statement: {e}"),
        }
    }
}

impl std::error::Error for GrammarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tokenize(e) => Some(e),
            Self::Empty => None,
        }
    }
}

impl From<TokenizerError> for GrammarError {
    fn from(e: TokenizerError) -> Self {
        Self::Tokenize(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> ParsedStatement {
        SqlGrammar.parse(sql).expect("parse")
    }

    fn columns(statement: &ParsedStatement) -> Vec<&str> {
        statement.columns.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_kinds() {
        assert_eq!(parse("select * from t").kind, StatementKind::Select);
        assert_eq!(parse("  INSERT INTO t VALUES (1)").kind, StatementKind::Insert);
        assert_eq!(parse("UPDATE t SET a = 1").kind, StatementKind::Update);
        assert_eq!(parse("DELETE FROM t").kind, StatementKind::Delete);
        assert_eq!(parse("REPLACE INTO t (a) VALUES (1)").kind, StatementKind::Replace);
        assert_eq!(parse("CREATE TABLE t (a TEXT)").kind, StatementKind::Create);
        assert_eq!(parse("PRAGMA user_version").kind, StatementKind::Other);
        assert!(parse("DELETE FROM t").kind.is_mutating());
        assert!(!parse("SELECT 1").kind.is_mutating());
    }

    #[test]
    fn test_where_columns() {
        let statement = parse(
            "SELECT * FROM nodes WHERE latencyZone = ? AND freeMem >= 2 \
             AND id NOT IN (1, 2) AND \"externalAddress\" LIKE 'tcp%' AND freeCpu IS NOT NULL",
        );
        assert_eq!(
            columns(&statement),
            ["externaladdress", "freecpu", "freemem", "id", "latencyzone"]
        );
        assert!(!statement.all_columns);
    }

    #[test]
    fn test_update_set_and_where() {
        let statement = parse("UPDATE nodes SET freeMem = 3, freeCpu = 1 WHERE id = 'a'");
        assert_eq!(columns(&statement), ["freecpu", "freemem", "id"]);
    }

    #[test]
    fn test_insert_column_list() {
        let statement = parse("INSERT OR REPLACE INTO main.nodes (id, latencyZone) VALUES (?, ?)");
        assert_eq!(statement.kind, StatementKind::Insert);
        assert_eq!(columns(&statement), ["id", "latencyzone"]);
        assert!(!statement.all_columns);

        let statement = parse("INSERT INTO nodes VALUES (?, ?, ?, ?, ?)");
        assert!(statement.all_columns);
    }

    #[test]
    fn test_delete_without_where_touches_everything() {
        assert!(parse("DELETE FROM nodes").all_columns);
        let statement = parse("DELETE FROM nodes WHERE id = ?");
        assert!(!statement.all_columns);
        assert_eq!(columns(&statement), ["id"]);
    }

    #[test]
    fn test_touches_any() {
        let statement = parse("UPDATE nodes SET freeMem = 1 WHERE id = ?");
        assert!(statement.touches_any(["FreeMem"]));
        assert!(!statement.touches_any(["latencyZone"]));
        assert!(parse("DELETE FROM nodes").touches_any(["anything"]));
        assert!(!parse("DELETE FROM nodes").touches_any([]));
    }

    #[test]
    fn test_empty_statement() {
        assert!(matches!(SqlGrammar.parse("   "), Err(GrammarError::Empty)));
    }
}
