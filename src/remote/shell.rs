//! Shell command builders for the remote side.
//!
//! Every path interpolated into a remote command goes through [`quote`].

/// Quote a word for POSIX `sh` using single quotes
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Join a remote directory and a relative path with a single `/`
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Parent directory of a remote path (`"."` when there is none)
pub fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

pub fn mkdir_p(dir: &str) -> String {
    format!("mkdir -p {}", quote(dir))
}

pub fn test_dir(dir: &str) -> String {
    format!("test -d {}", quote(dir))
}

pub fn test_file(path: &str) -> String {
    format!("test -f {}", quote(path))
}

pub fn test_exists(path: &str) -> String {
    format!("test -e {}", quote(path))
}

/// Delete a file or a whole directory
pub fn remove_path(path: &str) -> String {
    format!("rm -rf {}", quote(path))
}

pub fn sha256sum(path: &str) -> String {
    format!("sha256sum {}", quote(path))
}

pub fn list_dir(dir: &str) -> String {
    format!("ls -1 {}", quote(dir))
}

pub fn find_files(dir: &str) -> String {
    format!("find {} -type f", quote(dir))
}

pub fn chmod_x(path: &str) -> String {
    format!("chmod +x {}", quote(path))
}

/// Pack `dir` into `dir.tar.gz` and remove the directory
pub fn gzip_dir(dir: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!(
        "tar -czf {} -C {} . && rm -rf {}",
        quote(&format!("{dir}.tar.gz")),
        quote(dir),
        quote(dir)
    )
}

/// Unpack `dir.tar.gz` back into `dir` and remove the archive
pub fn gunzip_dir(dir: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let archive = format!("{dir}.tar.gz");
    format!(
        "mkdir -p {} && tar -xzf {} -C {} && rm -f {}",
        quote(dir),
        quote(&archive),
        quote(dir),
        quote(&archive)
    )
}

/// Remove everything inside `dir`, keeping the directory itself
pub fn clear_dir(dir: &str) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +",
        quote(dir)
    )
}

/// Delete every file under `dir` whose name is not kept by name or wildcard
pub fn prune_files(dir: &str, keep_names: &[String], keep_patterns: &[String]) -> String {
    let mut command = format!("find {} -type f", quote(dir));
    for keep in keep_names.iter().chain(keep_patterns) {
        command.push_str(" ! -name ");
        command.push_str(&quote(keep));
    }
    command.push_str(" -delete");
    command
}

/// Copy the contents of `source` into `target`
pub fn copy_contents(source: &str, target: &str) -> String {
    format!("cp -r {}/. {}", quote(source), quote(target))
}

/// Match a file name against a shell wildcard (`*` and `?`)
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Split a command line into words, honouring single quotes. Used to read
/// back commands produced by this module.
pub fn split(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
