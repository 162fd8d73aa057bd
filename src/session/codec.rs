use super::*;

use crate::lgw;

/// Parser applied to a framed, CR-stripped response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCodec {
    /// OS shell output: echo line and trailing prompt removed.
    #[default]
    Shell,
    /// One or more LGW frames.
    Lgw,
    /// Text handed back as received.
    Raw,
}

impl ResponseCodec {
    pub fn parse(self, text: &str, prompt_marker: &str) -> Result<Payload, EngineError> {
        match self {
            ResponseCodec::Shell => Ok(Payload::Text(strip_shell_echo(text, prompt_marker))),
            ResponseCodec::Lgw => lgw::decode(text).map(Payload::Lgw),
            ResponseCodec::Raw => Ok(Payload::Text(text.to_string())),
        }
    }
}

/// Drops the echoed command line and cuts the last line at `prompt_marker`.
///
/// An empty marker leaves the last line whole. Trailing whitespace is trimmed.
pub fn strip_shell_echo(text: &str, prompt_marker: &str) -> String {
    let mut lines: Vec<&str> = text.lines().skip(1).collect();
    if let Some(last) = lines.last_mut()
        && !prompt_marker.is_empty()
        && let Some((head, _)) = last.split_once(prompt_marker)
    {
        *last = head;
    }
    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "root@rtl8196e:";

    #[test]
    fn shell_output_loses_echo_and_prompt() {
        let text = "uname -a\nLinux rtl8196e 2.6.30\nroot@rtl8196e:~# ";
        assert_eq!(strip_shell_echo(text, MARKER), "Linux rtl8196e 2.6.30");
    }

    #[test]
    fn multi_line_output_is_preserved() {
        let text = "ls /tmp\na\nb\nc\nroot@rtl8196e:/tmp# ";
        assert_eq!(strip_shell_echo(text, MARKER), "a\nb\nc");
    }

    #[test]
    fn echo_only_yields_empty_text() {
        assert_eq!(strip_shell_echo("reboot", MARKER), "");
        assert_eq!(strip_shell_echo("", MARKER), "");
    }

    #[test]
    fn foreign_prompt_is_kept() {
        let text = "id\nuid=0(root)\n/ # ";
        assert_eq!(strip_shell_echo(text, MARKER), "uid=0(root)\n/ #");
        assert_eq!(strip_shell_echo("id\nuid=0\nroot@rtl8196e:~# ", ""), "uid=0\nroot@rtl8196e:~#");
    }

    #[test]
    fn raw_codec_returns_text_untouched() {
        let payload = ResponseCodec::Raw.parse("echo\nout\n#", MARKER).unwrap();
        assert_eq!(payload, Payload::Text("echo\nout\n#".into()));
    }

    #[test]
    fn lgw_codec_rejects_plain_text() {
        let err = ResponseCodec::Lgw.parse("garbage:#", MARKER).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ExpectMissing);
    }

    #[test]
    fn codec_names_are_snake_case() {
        assert_eq!(serde_json::to_string(&ResponseCodec::Lgw).unwrap(), "\"lgw\"");
    }
}
