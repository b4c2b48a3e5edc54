//! SSH-style escape sequence recognition for the attach client.
//!
//! `~.` detaches, `~~` sends a literal tilde, `~?` prints help. A tilde is
//! only special when the previous byte was a newline (or the stream just
//! started); a pending tilde is either consumed by the next byte or
//! flushed as a literal when a newline arrives.

/// Help text printed on `~?`.
pub const ESCAPE_HELP: &str = "\r\nSupported escape sequences:\r\n  ~.  Disconnect from session (VM keeps running)\r\n  ~~  Send literal ~ character\r\n  ~?  Show this help\r\n";

/// Byte-at-a-time escape automaton. Not reusable across clients; state is
/// per attached stream.
#[derive(Debug)]
pub struct EscapeFilter {
    after_newline: bool,
    pending_tilde: bool,
}

/// Result of feeding one input batch through the filter.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    /// Bytes to forward to the console.
    pub forward: Vec<u8>,
    /// Bytes to print locally (help text).
    pub echo: Vec<u8>,
    /// `~.` was recognized; the rest of the batch is discarded.
    pub detach: bool,
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self {
            // Stream start counts as after-newline so a leading ~. works.
            after_newline: true,
            pending_tilde: false,
        }
    }

    /// Process a batch of input bytes.
    pub fn feed(&mut self, input: &[u8]) -> Filtered {
        let mut out = Filtered::default();

        for &b in input {
            if b == b'\n' || b == b'\r' {
                if self.pending_tilde {
                    // The tilde was not an escape after all.
                    out.forward.push(b'~');
                    self.pending_tilde = false;
                }
                out.forward.push(b);
                self.after_newline = true;
                continue;
            }

            if self.after_newline && b == b'~' {
                self.pending_tilde = true;
                self.after_newline = false;
                continue;
            }

            if self.pending_tilde {
                self.pending_tilde = false;
                match b {
                    b'.' => {
                        out.detach = true;
                        return out;
                    }
                    b'~' => out.forward.push(b'~'),
                    b'?' => out.echo.extend_from_slice(ESCAPE_HELP.as_bytes()),
                    other => {
                        out.forward.push(b'~');
                        out.forward.push(other);
                    }
                }
                self.after_newline = false;
                continue;
            }

            out.forward.push(b);
            self.after_newline = false;
        }

        out
    }
}

impl Default for EscapeFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_only(bytes: &[u8]) -> Filtered {
        Filtered {
            forward: bytes.to_vec(),
            echo: Vec::new(),
            detach: false,
        }
    }

    #[test]
    fn test_plain_bytes_pass_through() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"hello world"), forward_only(b"hello world"));
    }

    #[test]
    fn test_detach_at_stream_start() {
        let mut f = EscapeFilter::new();
        let out = f.feed(b"~.");
        assert!(out.detach);
        assert!(out.forward.is_empty());
    }

    #[test]
    fn test_detach_after_newline() {
        let mut f = EscapeFilter::new();
        let out = f.feed(b"hi\n~.");
        assert!(out.detach);
        assert_eq!(out.forward, b"hi\n");
    }

    #[test]
    fn test_detach_discards_rest_of_batch() {
        let mut f = EscapeFilter::new();
        let out = f.feed(b"\n~.leftover");
        assert!(out.detach);
        assert_eq!(out.forward, b"\n");
    }

    #[test]
    fn test_tilde_mid_line_is_literal() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"a~."), forward_only(b"a~."));
    }

    #[test]
    fn test_double_tilde_emits_one() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"~~"), forward_only(b"~"));
    }

    #[test]
    fn test_help_echoes_and_forwards_nothing() {
        let mut f = EscapeFilter::new();
        let out = f.feed(b"~?");
        assert!(!out.detach);
        assert!(out.forward.is_empty());
        assert_eq!(out.echo, ESCAPE_HELP.as_bytes());
    }

    #[test]
    fn test_tilde_other_byte_emits_both() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"~x"), forward_only(b"~x"));
    }

    #[test]
    fn test_newline_flushes_pending_tilde() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"~\n"), forward_only(b"~\n"));
        // After the newline a fresh tilde is special again.
        let out = f.feed(b"~.");
        assert!(out.detach);
    }

    #[test]
    fn test_carriage_return_counts_as_newline() {
        let mut f = EscapeFilter::new();
        let out = f.feed(b"cmd\r~.");
        assert!(out.detach);
        assert_eq!(out.forward, b"cmd\r");
    }

    #[test]
    fn test_state_spans_batches() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.feed(b"line\n"), forward_only(b"line\n"));
        assert_eq!(f.feed(b"~"), forward_only(b""));
        let out = f.feed(b".");
        assert!(out.detach);
    }

    #[test]
    fn test_stripped_escapes_preserve_remaining_bytes() {
        // The forwarded stream equals the input minus recognized sequences.
        let mut f = EscapeFilter::new();
        let out = f.feed(b"abc\n~~def\n~?ghi");
        assert_eq!(out.forward, b"abc\n~def\nghi");
    }

    #[test]
    fn test_second_tilde_after_literal_not_special() {
        let mut f = EscapeFilter::new();
        // ~~ emits a literal ~; the next ~ is mid-line, so stays literal.
        assert_eq!(f.feed(b"~~~"), forward_only(b"~~"));
    }
}
