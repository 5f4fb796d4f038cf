//! Response text cleanup

use once_cell::sync::Lazy;
use regex::Regex;

use super::artifacts::Artifact;

/// Artifact download panel: "Artefakte ... Alles herunterladen ... <entry>\n"
static ARTIFACT_PANEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)Artefakte[\s\S]*?Alles herunterladen[\s\S]*?(Kodierhandbuch|Optimized category|Code|Dokument)[^\n]*\n",
    )
    .unwrap()
});

static PANEL_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Artefakte\s*$").unwrap());

static PANEL_DOWNLOAD_ALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Alles herunterladen\s*$").unwrap());

static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strip artifact-panel chrome, collapse blank runs, trim
pub fn clean_response(text: &str) -> String {
    let text = ARTIFACT_PANEL.replace_all(text, "");
    let text = PANEL_HEADING.replace_all(&text, "");
    let text = PANEL_DOWNLOAD_ALL.replace_all(&text, "");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Append artifacts as `---ARTIFACT:{title}---` sections
pub fn append_artifacts(text: &str, artifacts: &[Artifact]) -> String {
    let mut out = text.to_string();
    for artifact in artifacts {
        out.push_str(&format!(
            "\n\n---ARTIFACT:{}---\n{}\n---END_ARTIFACT---\n",
            artifact.title, artifact.content
        ));
    }
    out
}
