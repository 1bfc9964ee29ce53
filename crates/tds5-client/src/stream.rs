//! Lazy response token stream.
//!
//! A [`ResponseStream`] pulls one token per [`Iterator::next`] call from the
//! connection, applying each token's side effects to the session before it
//! is handed out. It ends after the first token that terminates the
//! response.

use std::io::{Read, Write};
use std::iter::FusedIterator;
use std::net::TcpStream;
use std::sync::Arc;

use encoding_rs::Encoding;
use tds5_protocol::{Format, ServerMessage, Token};

use crate::client::Client;
use crate::error::Result;
use crate::query::QueryResult;

/// Tokens of one response, read on demand.
///
/// Dropping the stream before it is finished leaves the client in
/// [`Fetching`](crate::ConnectionState::Fetching); call
/// [`Client::cancel`] to resynchronise.
///
/// # Example
///
/// ```rust,ignore
/// let mut stream = client.execute_sql("select id from t", &[])?;
/// for token in stream.by_ref() {
///     if let Token::Row(row) = token? {
///         let id: i32 = row.get(0)?;
///     }
/// }
/// stream.finish()?;
/// ```
pub struct ResponseStream<'a, R: Read = TcpStream, W: Write = TcpStream> {
    client: &'a mut Client<R, W>,
    finished: bool,
    tokens: usize,
}

impl<'a, R: Read, W: Write> ResponseStream<'a, R, W> {
    pub(crate) fn new(client: &'a mut Client<R, W>) -> Self {
        Self {
            client,
            finished: false,
            tokens: 0,
        }
    }

    /// Whether the end of the response has been read (or reading failed).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether an error message has been received so far.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.client.session().is_error()
    }

    /// Messages received so far.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        self.client.session().messages()
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.client.session().database()
    }

    /// Current character encoding.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        self.client.session().encoding()
    }

    /// Current charset name.
    #[must_use]
    pub fn charset(&self) -> &str {
        self.client.session().charset()
    }

    /// The format describing rows of this response, until the response ends.
    #[must_use]
    pub fn current_format(&self) -> Option<&Arc<Format>> {
        self.client.session().current_format()
    }

    /// Drain the rest of the response.
    pub fn finish(mut self) -> Result<()> {
        self.drain_into(None)?;
        self.check_error()
    }

    /// Drain the rest of the response and return the tokens.
    pub fn collect_tokens(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        self.drain_into(Some(&mut tokens))?;
        self.check_error()?;
        Ok(tokens)
    }

    /// Drain the rest of the response into a [`QueryResult`].
    pub fn into_result(mut self) -> Result<QueryResult> {
        let mut tokens = Vec::new();
        self.drain_into(Some(&mut tokens))?;
        self.check_error()?;
        Ok(QueryResult::new(tokens, self.messages().to_vec()))
    }

    /// Abandon the response: send an attention and wait for the server to
    /// acknowledge it.
    pub fn cancel(self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.client.cancel()
    }

    fn drain_into(&mut self, mut sink: Option<&mut Vec<Token>>) -> Result<()> {
        for token in self.by_ref() {
            let token = token?;
            if let Some(tokens) = sink.as_deref_mut() {
                tokens.push(token);
            }
        }
        Ok(())
    }

    fn check_error(&self) -> Result<()> {
        match self.client.session().server_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<R: Read, W: Write> Iterator for ResponseStream<'_, R, W> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.client.next_response_token() {
            Ok(token) => {
                self.tokens += 1;
                if token.is_end_of_response() {
                    self.finished = true;
                    tracing::debug!(tokens = self.tokens, "response complete");
                }
                Some(Ok(token))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: Read, W: Write> FusedIterator for ResponseStream<'_, R, W> {}

impl<R: Read, W: Write> std::fmt::Debug for ResponseStream<'_, R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("finished", &self.finished)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}
