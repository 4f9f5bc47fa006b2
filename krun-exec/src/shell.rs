//! `sh -c` wrapping for commands that need shell features (pipes, `&&`, cd).

/// Wrap an argv in `sh -c`, joining the arguments into one shell line.
///
/// An empty argv stays empty so validation can still reject it upstream.
pub fn wrap_command_in_shell(args: &[String]) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }
    vec!["sh".to_string(), "-c".to_string(), args.join(" ")]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wraps_commands_in_sh_dash_c() {
        let cases: &[(&[&str], &[&str])] = &[
            (&[], &[]),
            (&["hostname"], &["sh", "-c", "hostname"]),
            (
                &["pip", "install", "-r", "requirements.txt"],
                &["sh", "-c", "pip install -r requirements.txt"],
            ),
            (
                &["apt update && apt install -y vim"],
                &["sh", "-c", "apt update && apt install -y vim"],
            ),
            (
                &["cd /app && pip install .[core,tpu]"],
                &["sh", "-c", "cd /app && pip install .[core,tpu]"],
            ),
            (
                &["echo hello | grep hello"],
                &["sh", "-c", "echo hello | grep hello"],
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(wrap_command_in_shell(&argv(input)), argv(expected));
        }
    }
}
