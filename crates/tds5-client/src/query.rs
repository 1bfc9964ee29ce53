//! Fully drained query results.

use std::sync::Arc;

use tds5_protocol::{DataRow, DoneKind, Format, ServerMessage, Token};
use tds5_types::SqlValue;

/// Every token of one response, kept in wire order.
///
/// Rows of all result sets are available through [`rows`](Self::rows);
/// [`result_sets`](Self::result_sets) groups them by the format they were
/// decoded against.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    tokens: Vec<Token>,
    messages: Vec<ServerMessage>,
}

impl QueryResult {
    /// Create a result from drained tokens and the messages seen.
    #[must_use]
    pub fn new(tokens: Vec<Token>, messages: Vec<ServerMessage>) -> Self {
        Self { tokens, messages }
    }

    /// All tokens in wire order.
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Consume the result and return the tokens.
    #[must_use]
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    /// Result rows, excluding parameter values.
    pub fn rows(&self) -> impl Iterator<Item = &DataRow> {
        self.tokens.iter().filter_map(|token| match token {
            Token::Row(row) if !row.is_params() => Some(row),
            _ => None,
        })
    }

    /// Rows grouped by result set, each with its format.
    #[must_use]
    pub fn result_sets(&self) -> Vec<(Arc<Format>, Vec<&DataRow>)> {
        let mut sets: Vec<(Arc<Format>, Vec<&DataRow>)> = Vec::new();
        for row in self.rows() {
            match sets.last_mut() {
                Some((format, rows)) if Arc::ptr_eq(format, row.format()) => rows.push(row),
                _ => sets.push((Arc::clone(row.format()), vec![row])),
            }
        }
        sets
    }

    /// Format of the first result set.
    #[must_use]
    pub fn columns(&self) -> Option<&Arc<Format>> {
        self.rows().next().map(DataRow::format)
    }

    /// Total row count reported by statement-level done tokens.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.tokens
            .iter()
            .filter_map(|token| match token {
                Token::Done(done) if done.kind != DoneKind::DoneProc => done.row_count,
                _ => None,
            })
            .map(u64::from)
            .sum()
    }

    /// Last return status, if a procedure returned one.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.tokens.iter().rev().find_map(|token| match token {
            Token::ReturnStatus(status) => Some(*status),
            _ => None,
        })
    }

    /// Output parameter values, if the server returned any.
    #[must_use]
    pub fn output_params(&self) -> Option<&DataRow> {
        self.tokens.iter().rev().find_map(|token| match token {
            Token::Row(row) if row.is_params() => Some(row),
            _ => None,
        })
    }

    /// Get an output parameter value by name (case-insensitive, `@` optional).
    #[must_use]
    pub fn get_output(&self, name: &str) -> Option<&SqlValue> {
        let params = self.output_params()?;
        let wanted = name.trim_start_matches('@');
        let index = params
            .format()
            .entries
            .iter()
            .position(|entry| entry.name.trim_start_matches('@').eq_ignore_ascii_case(wanted))?;
        params.value(index)
    }

    /// Messages received while the response was read.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tds5_protocol::{Done, DoneStatus, FormatEntry, TokenType, TypeId, TypeMetadata};

    use super::*;

    fn format(token_type: TokenType, name: &str) -> Arc<Format> {
        Arc::new(Format::new(
            token_type,
            vec![FormatEntry::new(name, TypeId::Int4, TypeMetadata::default())],
        ))
    }

    fn row(format: &Arc<Format>, token_type: TokenType, value: i32) -> Token {
        Token::Row(DataRow::new(token_type, Arc::clone(format), vec![SqlValue::Int(value)]))
    }

    #[test]
    fn test_rows_and_result_sets() {
        let first = format(TokenType::RowFmt, "a");
        let second = format(TokenType::RowFmt, "b");
        let result = QueryResult::new(
            vec![
                Token::Format(Arc::clone(&first)),
                row(&first, TokenType::Row, 1),
                row(&first, TokenType::Row, 2),
                Token::Done(Done::new(DoneKind::Done).with_row_count(2).with_status(DoneStatus::MORE)),
                Token::Format(Arc::clone(&second)),
                row(&second, TokenType::Row, 3),
                Token::Done(Done::new(DoneKind::Done).with_row_count(1)),
            ],
            Vec::new(),
        );

        assert_eq!(result.rows().count(), 3);
        assert_eq!(result.rows_affected(), 3);
        let sets = result.result_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].1.len(), 2);
        assert_eq!(sets[1].1[0].get::<i32>(0).unwrap(), 3);
        assert_eq!(result.columns().unwrap().entries[0].name, "a");
    }

    #[test]
    fn test_procedure_outputs() {
        let params = format(TokenType::ParamFmt, "@total");
        let result = QueryResult::new(
            vec![
                Token::Done(Done::new(DoneKind::DoneInProc).with_row_count(4)),
                Token::ReturnStatus(0),
                Token::Format(Arc::clone(&params)),
                row(&params, TokenType::Params, 42),
                Token::Done(Done::new(DoneKind::DoneProc).with_row_count(4)),
            ],
            Vec::new(),
        );

        assert_eq!(result.rows().count(), 0);
        assert_eq!(result.rows_affected(), 4);
        assert_eq!(result.return_status(), Some(0));
        assert_eq!(result.get_output("total"), Some(&SqlValue::Int(42)));
        assert_eq!(result.get_output("@TOTAL"), Some(&SqlValue::Int(42)));
        assert!(result.get_output("missing").is_none());
    }

    #[test]
    fn test_empty_result() {
        let result = QueryResult::default();
        assert!(result.columns().is_none());
        assert!(result.return_status().is_none());
        assert_eq!(result.rows_affected(), 0);
    }
}
