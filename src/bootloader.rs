// Copyright 2024 Red Hat, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bootloader config rewriting for the Template Builder.
//!
//! Regex-driven whole-file edits are fragile: a stray match anywhere in the
//! file can corrupt an unrelated line. Instead each config is parsed into a
//! line model and rewritten by structured per-line transformation; a small
//! regex is still used, but only to pick a token apart *within* a line
//! already known to be a kernel/initrd line, not to search the whole file.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref LIVEISO_TOKEN: Regex = Regex::new(r"\s*coreos\.liveiso=\S+").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Grub,
    Isolinux,
}

impl ConfigFormat {
    pub fn for_logical_path(path: &str) -> Option<Self> {
        if path.eq_ignore_ascii_case("EFI/redhat/grub.cfg") {
            Some(Self::Grub)
        } else if path.eq_ignore_ascii_case("isolinux/isolinux.cfg") {
            Some(Self::Isolinux)
        } else {
            None
        }
    }
}

/// Rewrites a bootloader config's text to reference the ignition/ramdisk
/// splice points, per the Template Builder protocol. Lines that don't match
/// a kernel/initrd role are emitted byte-for-byte unchanged.
pub fn rewrite_config(
    contents: &str,
    format: ConfigFormat,
    rootfs_url_placeholder: &str,
    ramdisk_path: &str,
) -> String {
    let trailing_newline = contents.ends_with('\n');
    let mut out: Vec<String> = contents
        .lines()
        .map(|line| rewrite_line(line, format, rootfs_url_placeholder, ramdisk_path))
        .collect();
    let mut result = out.join("\n");
    if trailing_newline {
        result.push('\n');
    }
    out.clear();
    result
}

fn rewrite_line(
    line: &str,
    format: ConfigFormat,
    rootfs_url_placeholder: &str,
    ramdisk_path: &str,
) -> String {
    match format {
        ConfigFormat::Grub => {
            let trimmed = line.trim_start();
            if trimmed.starts_with("linux ") || trimmed == "linux" {
                let stripped = LIVEISO_TOKEN.replace_all(line, "");
                format!(
                    "{} coreos.live.rootfs_url='{}'",
                    stripped.trim_end(),
                    rootfs_url_placeholder
                )
            } else if trimmed.starts_with("initrd ") || trimmed == "initrd" {
                format!("{} {}", line.trim_end(), ramdisk_path)
            } else {
                line.to_string()
            }
        }
        ConfigFormat::Isolinux => {
            let trimmed = line.trim_start();
            if trimmed.starts_with("append ") {
                rewrite_isolinux_append(line, rootfs_url_placeholder, ramdisk_path)
            } else {
                line.to_string()
            }
        }
    }
}

/// Rewrites one isolinux `append ...` line: strips any `coreos.liveiso=`
/// token, inserts `ramdisk_path` into the comma-separated `initrd=` list
/// (if present), and appends `coreos.live.rootfs_url=`.
fn rewrite_isolinux_append(line: &str, rootfs_url_placeholder: &str, ramdisk_path: &str) -> String {
    let stripped = LIVEISO_TOKEN.replace_all(line, "");
    let mut tokens: Vec<String> = Vec::new();
    let mut saw_initrd = false;
    for token in stripped.trim_end().split(' ') {
        if let Some(list) = token.strip_prefix("initrd=") {
            saw_initrd = true;
            let mut entries: Vec<&str> = list.split(',').filter(|e| !e.is_empty()).collect();
            entries.push(ramdisk_path);
            tokens.push(format!("initrd={}", entries.join(",")));
        } else {
            tokens.push(token.to_string());
        }
    }
    if !saw_initrd {
        tokens.push(format!("initrd={ramdisk_path}"));
    }
    tokens.push(format!("coreos.live.rootfs_url={rootfs_url_placeholder}"));
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grub_rewrite() {
        let contents = "\
menuentry 'CoreOS' {
    linux /images/pxeboot/vmlinuz coreos.liveiso=rhcos-412.86 ignition.firstboot
    initrd /images/pxeboot/initrd.img /images/ignition.img
}
";
        let out = rewrite_config(
            contents,
            ConfigFormat::Grub,
            "http://example/rootfs",
            "/images/assisted_installer_custom.img",
        );
        assert!(out.contains(
            "linux /images/pxeboot/vmlinuz ignition.firstboot coreos.live.rootfs_url='http://example/rootfs'"
        ));
        assert!(!out.contains("coreos.liveiso"));
        assert!(out.contains(
            "initrd /images/pxeboot/initrd.img /images/ignition.img /images/assisted_installer_custom.img"
        ));
        assert!(out.contains("menuentry 'CoreOS' {"));
    }

    #[test]
    fn test_isolinux_rewrite() {
        let line = "  append initrd=main.img,ignition.img coreos.liveiso=rhcos-412.86 ignition.firstboot";
        let out = rewrite_line(
            line,
            ConfigFormat::Isolinux,
            "http://example/rootfs",
            "assisted_installer_custom.img",
        );
        assert_eq!(
            out,
            "append initrd=main.img,ignition.img,assisted_installer_custom.img ignition.firstboot coreos.live.rootfs_url=http://example/rootfs"
        );
    }

    #[test]
    fn test_applied_exactly_once_per_line() {
        let contents = "linux /vmlinuz\nlinux /vmlinuz\n";
        let out = rewrite_config(contents, ConfigFormat::Grub, "u", "/r.img");
        assert_eq!(
            out.matches("coreos.live.rootfs_url").count(),
            2,
            "each matching line gets exactly one rewrite"
        );
    }

    #[test]
    fn test_unrelated_lines_untouched() {
        let contents = "set timeout=5\nmenuentry 'x' {\n}\n";
        assert_eq!(
            rewrite_config(contents, ConfigFormat::Grub, "u", "/r.img"),
            contents
        );
    }
}
