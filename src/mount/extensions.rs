//! Container file extensions that invite interference.
//!
//! Extensions on this list are either under OS resource protection or
//! routinely rewritten/quarantined by antivirus software; a container
//! named like one tends to get corrupted from the outside. Mounting
//! still succeeds, the caller just gets an advisory warning.

/// Extensions protected by OS resource protection, followed by the
/// ones antivirus products commonly watch.
static PROBLEM_FILE_EXTENSIONS: &[&str] = &[
    ".asa", ".asp", ".aspx", ".ax", ".bas", ".bat", ".bin", ".cer", ".chm", ".clb", ".cmd",
    ".cnt", ".cnv", ".com", ".cpl", ".cpx", ".crt", ".csh", ".dll", ".drv", ".dtd", ".exe",
    ".fxp", ".grp", ".h1s", ".hlp", ".hta", ".ime", ".inf", ".ins", ".isp", ".its", ".js",
    ".jse", ".ksh", ".lnk", ".mad", ".maf", ".mag", ".mam", ".man", ".maq", ".mar", ".mas",
    ".mat", ".mau", ".mav", ".maw", ".mda", ".mdb", ".mde", ".mdt", ".mdw", ".mdz", ".msc",
    ".msi", ".msp", ".mst", ".mui", ".nls", ".ocx", ".ops", ".pal", ".pcd", ".pif", ".prf",
    ".prg", ".pst", ".reg", ".scf", ".scr", ".sct", ".shb", ".shs", ".sys", ".tlb", ".tsp",
    ".url", ".vb", ".vbe", ".vbs", ".vsmacros", ".vss", ".vst", ".vsw", ".ws", ".wsc",
    ".wsf", ".wsh", ".xsd", ".xsl",
    ".386", ".acm", ".ade", ".adp", ".ani", ".app", ".asd", ".asf", ".asx", ".awx", ".boo",
    ".bz2", ".cdf", ".class", ".dhtm", ".dhtml", ".dlo", ".emf", ".eml", ".flt", ".fot",
    ".gz", ".htm", ".html", ".ini", ".j2k", ".jar", ".jff", ".jif", ".jmh", ".jng", ".jp2",
    ".jpe", ".jpeg", ".jpg", ".lsp", ".mod", ".nws", ".obj", ".olb", ".osd", ".ov1", ".ov2",
    ".ov3", ".ovl", ".ovr", ".pdr", ".pgm", ".php", ".pkg", ".pl", ".png", ".pot", ".pps",
    ".ppt", ".ps1", ".ps1xml", ".psc1", ".rar", ".rpl", ".rtf", ".sbf", ".script", ".sh",
    ".sha", ".shtm", ".shtml", ".spl", ".swf", ".tar", ".tgz", ".tmp", ".ttf", ".vcs",
    ".vlm", ".vxd", ".vxo", ".wiz", ".wll", ".wmd", ".wmf", ".wms", ".wmz", ".wpc", ".wwk",
    ".xhtm", ".xhtml", ".xl", ".xml", ".zip", ".7z",
];

/// True when the file name carries a problematic extension.
pub fn has_problematic_extension(file_name: &str) -> bool {
    let Some(dot) = file_name.rfind('.') else {
        return false;
    };
    let ext = &file_name[dot..];
    PROBLEM_FILE_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_protected_and_av_watched_extensions() {
        assert!(has_problematic_extension(r"D:\containers\vault.exe"));
        assert!(has_problematic_extension("backup.ZIP"));
        assert!(has_problematic_extension("notes.xml"));
    }

    #[test]
    fn passes_ordinary_container_names() {
        assert!(!has_problematic_extension(r"D:\containers\vault.vg"));
        assert!(!has_problematic_extension("no_extension"));
        assert!(!has_problematic_extension("archive.dat"));
    }
}
