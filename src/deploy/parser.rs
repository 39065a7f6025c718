//! 命令流解析
//!
//! 把扁平的命令行列表切分为有序的命令组：普通单行命令，
//! 或以 shebang / heredoc 标记开头、以 `EOF` 行结束的脚本块。
//! 纯函数，无 I/O。

use serde::Serialize;

/// 脚本块起始标记（按行首匹配，允许后跟重定向等参数）
pub const SCRIPT_MARKERS: &[&str] = &[
    "#!/bin/bash",
    "#!/bin/sh",
    "#!/usr/bin/env bash",
    "#!/usr/bin/env sh",
    "cat << 'EOF'",
    "cat << EOF",
    "tee << 'EOF'",
    "tee << EOF",
];

/// 命令组
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandGroup {
    /// 单行命令
    Single { command: String },
    /// 脚本块；`raw_lines` 含起止标记行，`content` 为实际执行的脚本内容
    Script {
        raw_lines: Vec<String>,
        content: String,
    },
}

impl CommandGroup {
    pub fn single(command: impl Into<String>) -> Self {
        CommandGroup::Single {
            command: command.into(),
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, CommandGroup::Script { .. })
    }

    /// 执行文本
    pub fn text(&self) -> &str {
        match self {
            CommandGroup::Single { command } => command,
            CommandGroup::Script { content, .. } => content,
        }
    }

    /// 序列化回原始行，重新解析得到相同的命令组
    pub fn to_lines(&self) -> Vec<String> {
        match self {
            CommandGroup::Single { command } => vec![command.clone()],
            CommandGroup::Script { raw_lines, .. } => raw_lines.clone(),
        }
    }

    /// 日志中展示的简短描述
    pub fn label(&self) -> String {
        match self {
            CommandGroup::Single { command } => command.clone(),
            CommandGroup::Script { raw_lines, .. } => {
                let opener = raw_lines.first().map(String::as_str).unwrap_or("");
                format!("script ({} lines): {}", raw_lines.len(), opener.trim())
            }
        }
    }
}

fn is_script_marker(line: &str) -> bool {
    SCRIPT_MARKERS.iter().any(|marker| line.starts_with(marker))
}

fn is_terminator(line: &str) -> bool {
    line == "EOF" || line == "'EOF'"
}

/// 开启脚本块的标记行
struct OpenBlock {
    raw_lines: Vec<String>,
}

impl OpenBlock {
    fn opener(&self) -> &str {
        self.raw_lines.first().map(|l| l.trim()).unwrap_or("")
    }

    fn into_group(self, terminated: bool) -> CommandGroup {
        let opener = self.opener().to_string();
        let body_end = if terminated {
            self.raw_lines.len() - 1
        } else {
            self.raw_lines.len()
        };
        let body = &self.raw_lines[1..body_end.max(1)];

        let content = if opener.starts_with("#!") {
            // shebang 本身就是脚本头
            std::iter::once(opener.as_str())
                .chain(body.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        } else if is_bare_heredoc(&opener) {
            body.join("\n")
        } else {
            // heredoc 带重定向等参数时需要完整保留，才能写出目标文件
            std::iter::once(opener.as_str())
                .chain(body.iter().map(String::as_str))
                .chain(std::iter::once("EOF"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        CommandGroup::Script {
            raw_lines: self.raw_lines,
            content,
        }
    }
}

fn is_bare_heredoc(opener: &str) -> bool {
    SCRIPT_MARKERS
        .iter()
        .filter(|marker| !marker.starts_with("#!"))
        .any(|marker| opener == *marker)
}

/// 解析命令列表；每个元素可以包含多行
pub fn parse(raw_commands: &[String]) -> Vec<CommandGroup> {
    let mut groups = Vec::new();
    let mut open: Option<OpenBlock> = None;

    for line in raw_commands.iter().flat_map(|command| command.lines()) {
        let trimmed = line.trim();

        if let Some(block) = open.as_mut() {
            // 块内的空行与注释原样保留
            block.raw_lines.push(line.to_string());
            if is_terminator(trimmed) {
                if let Some(block) = open.take() {
                    groups.push(block.into_group(true));
                }
            }
            continue;
        }

        if is_script_marker(trimmed) {
            open = Some(OpenBlock {
                raw_lines: vec![trimmed.to_string()],
            });
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        groups.push(CommandGroup::single(trimmed));
    }

    // 未闭合的块按脚本处理
    if let Some(block) = open.take() {
        groups.push(block.into_group(false));
    }

    groups
}

/// 把命令组序列化回原始行
pub fn serialize(groups: &[CommandGroup]) -> Vec<String> {
    groups.iter().flat_map(CommandGroup::to_lines).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_heredoc_example() {
        let groups = parse(&lines(&["echo hi", "cat << 'EOF'", "line1", "EOF", "echo done"]));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], CommandGroup::single("echo hi"));
        assert!(groups[1].is_script());
        assert_eq!(groups[1].text(), "line1");
        assert_eq!(groups[2], CommandGroup::single("echo done"));
    }

    #[test]
    fn test_skips_top_level_comments_and_blanks() {
        let groups = parse(&lines(&["", "# install", "  ", "apt-get update"]));
        assert_eq!(groups, vec![CommandGroup::single("apt-get update")]);
    }

    #[test]
    fn test_shebang_block_keeps_comments() {
        let groups = parse(&lines(&[
            "#!/bin/bash",
            "# inside the script",
            "",
            "set -e",
            "EOF",
            "uptime",
        ]));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].text(), "#!/bin/bash\n# inside the script\n\nset -e");
        assert_eq!(groups[1], CommandGroup::single("uptime"));
    }

    #[test]
    fn test_heredoc_with_redirect_keeps_wrapper() {
        let groups = parse(&lines(&[
            "cat << 'EOF' > /etc/app.conf",
            "port=8080",
            "EOF",
        ]));
        assert_eq!(
            groups[0].text(),
            "cat << 'EOF' > /etc/app.conf\nport=8080\nEOF"
        );
    }

    #[test]
    fn test_multiline_elements_are_split() {
        let groups = parse(&lines(&["echo a\necho b", "tee << EOF\nx\n'EOF'"]));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].text(), "x");
    }

    #[test]
    fn test_unterminated_block_becomes_script() {
        let groups = parse(&lines(&["echo start", "#!/bin/sh", "echo inside"]));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].text(), "#!/bin/sh\necho inside");
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let input = lines(&[
            "# header",
            "echo hi",
            "#!/usr/bin/env bash",
            "# keep",
            "export A=1",
            "EOF",
            "cat << EOF",
            "",
            "EOF",
            "systemctl restart nginx",
            "tee << 'EOF' /tmp/x",
        ]);
        let first = parse(&input);
        let second = parse(&serialize(&first));
        assert_eq!(first, second);
        assert_eq!(parse(&input), first);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn line() -> impl Strategy<Value = String> {
            prop_oneof![
                prop::sample::select(SCRIPT_MARKERS.to_vec()).prop_map(String::from),
                Just("EOF".to_string()),
                Just("'EOF'".to_string()),
                Just(String::new()),
                "#[a-z ]{0,8}",
                "[ \t]{0,3}[a-z=$ ]{1,12}",
                "[a-z ]{1,6}\n[a-z# ]{0,6}",
            ]
        }

        proptest! {
            #[test]
            fn prop_parse_is_deterministic(input in proptest::collection::vec(line(), 0..24)) {
                prop_assert_eq!(parse(&input), parse(&input));
            }

            #[test]
            fn prop_reparse_of_serialized_groups_is_stable(input in proptest::collection::vec(line(), 0..24)) {
                let groups = parse(&input);
                prop_assert_eq!(parse(&serialize(&groups)), groups);
            }

            #[test]
            fn prop_comments_inside_block_are_kept(
                marker in prop::sample::select(SCRIPT_MARKERS.to_vec()),
                comments in proptest::collection::vec("#[a-z ]{0,8}", 1..6),
            ) {
                let mut input = vec![marker.to_string()];
                input.extend(comments.iter().cloned());
                input.push("EOF".to_string());

                let groups = parse(&input);
                prop_assert_eq!(groups.len(), 1);
                match &groups[0] {
                    CommandGroup::Script { raw_lines, .. } => {
                        prop_assert_eq!(&raw_lines[1..raw_lines.len() - 1], comments.as_slice());
                    }
                    other => prop_assert!(false, "expected script block, got {:?}", other),
                }
            }
        }
    }
}
