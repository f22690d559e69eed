use std::io;

#[macro_export]
macro_rules! check {
  ($cond: expr, $prompt: literal $(, $( $params: expr $(,)? )* )? ) => {
    if !$cond {
      tracing::warn!("[!] {}", format!($prompt $(, $( $params, )* )?));
    }
  }
}

/// Ask on the terminal without echoing the answer.
pub fn prompt_hidden(prompt: &str) -> io::Result<String> {
    rpassword::prompt_password(prompt)
}

pub fn indent_str(string: &str, level: usize) -> String {
    string.lines()
        .map(|line| format!("{:indent$} |  {}", "", line, indent=level))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> std::path::PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => path.into(),
    }
}
