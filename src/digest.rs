//! Line-level decoder for the modem byte stream.
//!
//! [`digest`] consumes at most one record from the head of the receive
//! buffer per call. The caller loops until [`Digested::Incomplete`] and
//! maps the results onto signals, the response slot and URC dispatch.

use crate::types::ArgumentValue;

#[derive(Debug, PartialEq)]
pub(crate) enum Digested {
    /// No complete record at the head of the buffer.
    Incomplete,
    /// Continuation prompt `>` consumed while a command was waiting.
    Prompt,
    /// Terminator `OK`.
    CommandDone,
    /// Terminator `ERROR`.
    CommandError,
    /// A `+NAME[: args]` line.
    Urc {
        command: String,
        arguments: Vec<ArgumentValue>,
    },
    /// Any other line; goes to the response slot.
    Response(String),
    /// A record was consumed without producing anything (empty line,
    /// wake-from-sleep marker).
    Skipped,
}

const WAKE_MARKER: u8 = 0xE0;
const MHTTP_IND: &[u8] = b"+MHTTPURC: \"ind\"";

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

pub(crate) fn digest(buf: &mut Vec<u8>, waiting_for_prompt: bool) -> Digested {
    if buf.is_empty() {
        return Digested::Incomplete;
    }

    if waiting_for_prompt && buf[0] == b'>' {
        buf.drain(..1);
        return Digested::Prompt;
    }

    let end = match find_crlf(buf) {
        Some(end) => end,
        None => {
            // ML307 firmware omits the newline after +MHTTPURC: "ind";
            // reinsert it so the line becomes extractable.
            if buf.len() >= MHTTP_IND.len() && buf.starts_with(MHTTP_IND) {
                match buf[1..].iter().position(|&b| b == b'+') {
                    Some(pos) => {
                        buf.splice(pos + 1..pos + 1, *b"\r\n");
                    }
                    None => buf.extend_from_slice(b"\r\n"),
                }
                match find_crlf(buf) {
                    Some(end) => end,
                    None => return Digested::Incomplete,
                }
            } else {
                return Digested::Incomplete;
            }
        }
    };

    if end == 0 {
        buf.drain(..2);
        return Digested::Skipped;
    }

    let result = {
        let line = &buf[..end];
        if line[0] == b'+' {
            let (command, values) = match line.windows(2).position(|w| w == b": ") {
                Some(pos) => (&line[1..pos], &line[pos + 2..]),
                // Desync fallback: a `+` line without `": "` keeps the whole
                // tail as the command name with no arguments.
                None => (&line[1..], &line[end..end]),
            };
            Digested::Urc {
                command: String::from_utf8_lossy(command).into_owned(),
                arguments: parse_arguments(&String::from_utf8_lossy(values)),
            }
        } else if line == b"OK" {
            Digested::CommandDone
        } else if line == b"ERROR" {
            Digested::CommandError
        } else if line[0] == WAKE_MARKER {
            Digested::Skipped
        } else {
            Digested::Response(String::from_utf8_lossy(line).into_owned())
        }
    };

    buf.drain(..end + 2);
    result
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.len() < 10 && s.bytes().all(|b| b.is_ascii_digit())
}

fn classify(item: &str) -> ArgumentValue {
    let item = item.trim();
    if item.len() >= 2 && item.starts_with('"') && item.ends_with('"') {
        ArgumentValue::String(item[1..item.len() - 1].to_string())
    } else if item.contains('.') {
        ArgumentValue::Double(item.parse().unwrap_or(0.0))
    } else if is_number(item) {
        ArgumentValue::Int(item.parse().unwrap_or(0), item.to_string())
    } else {
        ArgumentValue::String(item.to_string())
    }
}

fn parse_arguments(values: &str) -> Vec<ArgumentValue> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut items: Vec<&str> = values.split(',').collect();
    // A trailing comma does not produce an empty final argument.
    if values.ends_with(',') {
        items.pop();
    }
    items.into_iter().map(classify).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(buf: &mut Vec<u8>, waiting: bool) -> Vec<Digested> {
        let mut out = Vec::new();
        loop {
            match digest(buf, waiting) {
                Digested::Incomplete => return out,
                Digested::Skipped => continue,
                other => out.push(other),
            }
        }
    }

    #[test]
    fn parses_a_single_urc() {
        let mut buf = b"+CSQ: 25,99\r\n".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(
            out,
            vec![Digested::Urc {
                command: "CSQ".into(),
                arguments: vec![ArgumentValue::int(25), ArgumentValue::int(99)],
            }]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn classifies_quoted_double_and_long_numbers() {
        let mut buf = b"+MIPCALL: 0,1,\"10.0.0.1\"\r\n+X: 1.5,868123456789012\r\n".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(
            out[0],
            Digested::Urc {
                command: "MIPCALL".into(),
                arguments: vec![
                    ArgumentValue::int(0),
                    ArgumentValue::int(1),
                    ArgumentValue::String("10.0.0.1".into()),
                ],
            }
        );
        // 15 digits is past the integer cutoff and stays textual.
        assert_eq!(
            out[1],
            Digested::Urc {
                command: "X".into(),
                arguments: vec![
                    ArgumentValue::Double(1.5),
                    ArgumentValue::String("868123456789012".into()),
                ],
            }
        );
    }

    #[test]
    fn terminators_and_response_lines() {
        let mut buf = b"ML307R-DL\r\nOK\r\n".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(
            out,
            vec![
                Digested::Response("ML307R-DL".into()),
                Digested::CommandDone
            ]
        );

        let mut buf = b"ERROR\r\n".to_vec();
        assert_eq!(drain(&mut buf, false), vec![Digested::CommandError]);
    }

    #[test]
    fn empty_lines_and_wake_marker_are_skipped() {
        let mut buf = b"\r\n\xE0\r\n+CPIN: READY\r\n".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(
            out,
            vec![Digested::Urc {
                command: "CPIN".into(),
                arguments: vec![ArgumentValue::String("READY".into())],
            }]
        );
    }

    #[test]
    fn prompt_only_consumed_while_waiting() {
        let mut buf = b">".to_vec();
        assert_eq!(digest(&mut buf, false), Digested::Incomplete);
        assert_eq!(digest(&mut buf, true), Digested::Prompt);
        assert!(buf.is_empty());
    }

    #[test]
    fn urc_without_separator_keeps_whole_tail_as_name() {
        let mut buf = b"+MATREADY\r\n".to_vec();
        assert_eq!(
            drain(&mut buf, false),
            vec![Digested::Urc {
                command: "MATREADY".into(),
                arguments: vec![],
            }]
        );
    }

    #[test]
    fn trailing_comma_does_not_add_an_argument() {
        let mut buf = b"+CEREG: 2,\r\n".to_vec();
        assert_eq!(
            drain(&mut buf, false),
            vec![Digested::Urc {
                command: "CEREG".into(),
                arguments: vec![ArgumentValue::int(2)],
            }]
        );
    }

    #[test]
    fn mhttp_ind_missing_newline_is_repaired_at_end_of_buffer() {
        let mut buf = b"+MHTTPURC: \"ind\",0,200".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(
            out,
            vec![Digested::Urc {
                command: "MHTTPURC".into(),
                arguments: vec![
                    ArgumentValue::String("ind".into()),
                    ArgumentValue::int(0),
                    ArgumentValue::int(200),
                ],
            }]
        );
    }

    #[test]
    fn mhttp_ind_missing_newline_is_repaired_before_next_urc() {
        // No CRLF anywhere yet; the terminator is inserted before the
        // following `+` and the rest stays buffered.
        let mut buf = b"+MHTTPURC: \"ind\",0+CSQ: 20".to_vec();
        let out = drain(&mut buf, false);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Digested::Urc { command, .. } if command == "MHTTPURC"));
        assert_eq!(buf, b"+CSQ: 20");

        buf.extend_from_slice(b",99\r\n");
        let out = drain(&mut buf, false);
        assert!(matches!(&out[0], Digested::Urc { command, .. } if command == "CSQ"));
    }

    proptest! {
        // Feeding the same byte stream in arbitrary chunking produces the
        // same records as feeding it whole.
        #[test]
        fn chunking_invariance(splits in proptest::collection::vec(0usize..80, 0..6)) {
            let stream: &[u8] =
                b"+CSQ: 25,99\r\nfoo bar\r\nOK\r\n+MIPURC: \"rtcp\",2,5,\"48656C6C6F\"\r\nERROR\r\n";

            let mut whole = stream.to_vec();
            let expected = drain(&mut whole, false);

            let mut cuts: Vec<usize> = splits.iter().map(|s| s % stream.len()).collect();
            cuts.sort_unstable();
            cuts.dedup();

            let mut buf = Vec::new();
            let mut out = Vec::new();
            let mut last = 0;
            for cut in cuts.into_iter().chain(core::iter::once(stream.len())) {
                buf.extend_from_slice(&stream[last..cut]);
                last = cut;
                out.extend(drain(&mut buf, false));
            }
            prop_assert_eq!(out, expected);
        }
    }
}
