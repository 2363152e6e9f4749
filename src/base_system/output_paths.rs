//! 输出文件名清洗与绝对路径处理。

use std::path::{Path, PathBuf};

/// 去掉文件系统不允许的字符，超长截断到 255。
pub fn sanitize_file_name(name: &str) -> String {
    let reg = regex::Regex::new(r#"[<>:"/\\|?*]+"#).expect("static pattern");
    let safe = reg.replace_all(name, "-");
    let mut safe = safe.trim().to_string();
    if safe.len() > 255 {
        safe.truncate(255);
    }
    safe
}

/// 把用户给的路径转成绝对路径，同时清洗文件名部分。
///
/// 返回 (绝对路径, 文件名被修改时的提示)。
pub fn sanitized_absolute(name: &str) -> std::io::Result<(PathBuf, Option<String>)> {
    let abs = std::path::absolute(Path::new(name))?;
    let base = abs
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let sanitized = sanitize_file_name(&base);
    let parent = abs.parent().map(Path::to_path_buf).unwrap_or_default();
    let out = parent.join(&sanitized);
    if base != sanitized {
        let warn = format!("name {base} is not valid, using {sanitized} instead");
        return Ok((out, Some(warn)));
    }
    Ok((out, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_chars() {
        assert_eq!(
            sanitize_file_name("com.app-1.0-v12.apk"),
            "com.app-1.0-v12.apk"
        );
        assert_eq!(sanitize_file_name("a<b>c:d\"e.apk"), "a-b-c-d-e.apk");
        assert_eq!(sanitize_file_name("  name?.apk "), "name-.apk");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_file_name(&long).len(), 255);
    }

    #[test]
    fn sanitized_absolute_warns_on_bad_name() {
        let (path, warn) = sanitized_absolute("out|put.apk").unwrap();
        assert!(path.is_absolute());
        assert!(path.to_string_lossy().contains("out-put.apk"));
        assert!(warn.is_some());
    }
}
