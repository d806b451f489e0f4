//! Heuristic removal of editor keystrokes from a committed command list.
//!
//! Everything typed inside `vi`/`vim` that happens to be followed by a
//! carriage return lands in the command list. This pass collapses each editor
//! session down to its invocation (or to a later `fg` that resumed it) and
//! strips the part of a line typed before a Ctrl-Z suspend. It is lossy.

const SUSPEND: char = '\x1a';
const QUIT_TOKENS: [&str; 3] = [":wq", ":q", ":q!"];
const EDITORS: [&str; 2] = ["vi", "vim"];

pub fn scrub_editor_noise(commands: Vec<String>) -> Vec<String> {
    let commands: Vec<String> = commands
        .into_iter()
        .filter_map(|cmd| {
            if cmd.contains(SUSPEND) {
                cmd.split(SUSPEND)
                    .nth(1)
                    .filter(|rest| !rest.trim().is_empty())
                    .map(str::to_string)
            } else {
                Some(cmd)
            }
        })
        .collect();

    let mut cleaned = Vec::with_capacity(commands.len());
    let mut i = 0;
    while i < commands.len() {
        if !invokes_editor(&commands[i]) {
            cleaned.push(commands[i].clone());
            i += 1;
            continue;
        }

        let quit = (i + 1..commands.len()).find(|&j| contains_quit(&commands[j]));
        match quit {
            Some(quit) => {
                let anchor = (i + 1..quit)
                    .rev()
                    .find(|&j| first_word(&commands[j]) == Some("fg"))
                    .unwrap_or(i);
                cleaned.extend(commands[i..=anchor].iter().cloned());
                i = quit + 1;
            }
            None => {
                cleaned.push(commands[i].clone());
                i += 1;
            }
        }
    }
    cleaned
}

fn invokes_editor(cmd: &str) -> bool {
    cmd.split_whitespace().any(|word| {
        let base = word.rsplit('/').next().unwrap_or(word);
        EDITORS.contains(&base)
    })
}

fn contains_quit(cmd: &str) -> bool {
    QUIT_TOKENS.iter().any(|token| cmd.contains(token))
}

fn first_word(cmd: &str) -> Option<&str> {
    cmd.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn vim_session_collapses_to_invocation() {
        let cleaned = scrub_editor_noise(cmds(&["vi file.txt", "iHello world", "dd", ":wq", "ls"]));
        assert_eq!(cleaned, cmds(&["vi file.txt", "ls"]));
    }

    #[test]
    fn absolute_editor_path_and_sudo_are_recognised() {
        let cleaned = scrub_editor_noise(cmds(&["sudo /usr/bin/vim /etc/hosts", "x", ":q!"]));
        assert_eq!(cleaned, cmds(&["sudo /usr/bin/vim /etc/hosts"]));
    }

    #[test]
    fn fg_becomes_the_cutoff_anchor() {
        let cleaned = scrub_editor_noise(cmds(&["vim notes", "ps aux", "fg", "ihi", ":wq", "exit"]));
        assert_eq!(cleaned, cmds(&["vim notes", "ps aux", "fg", "exit"]));
    }

    #[test]
    fn suspend_keeps_text_after_ctrl_z() {
        let cleaned = scrub_editor_noise(cmds(&["itext\x1als -l", "\x1a", "pwd"]));
        assert_eq!(cleaned, cmds(&["ls -l", "pwd"]));
    }

    #[test]
    fn editor_without_quit_is_left_alone() {
        let cleaned = scrub_editor_noise(cmds(&["vi a", "uptime"]));
        assert_eq!(cleaned, cmds(&["vi a", "uptime"]));
    }

    #[test]
    fn lookalike_commands_are_not_editors() {
        let cleaned = scrub_editor_noise(cmds(&["view log", "service nginx reload", ":q"]));
        assert_eq!(cleaned, cmds(&["view log", "service nginx reload", ":q"]));
    }

    #[test]
    fn multiple_sessions_each_collapse() {
        let cleaned = scrub_editor_noise(cmds(&["vi a", "x", ":wq", "vim b", "y", ":q", "df"]));
        assert_eq!(cleaned, cmds(&["vi a", "vim b", "df"]));
    }
}
