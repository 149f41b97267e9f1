//! Prompt assembly from template files.
//!
//! Every prompt is built from plain-text templates in one directory
//! (`prompts.prompts_dir`). Item prompts are five sections joined by a
//! blank line:
//!
//! 1. system preamble (`single_item_system_prompt.txt` /
//!    `multi_item_system_prompt.txt`), followed in multi-item mode by the
//!    rendered product catalog
//! 2. `categories_context.txt`
//! 3. few-shot examples, `<lang>_examples.txt`
//! 4. `ambiguous_mappings.txt`
//! 5. the task template with `{raw_text}` and `{language_code}` substituted
//!
//! Detection and translation prompts are single templates with their own
//! placeholders.
//!
//! Template names never leave the directory: names containing a path
//! separator or `..` are rejected before the filesystem is touched, and a
//! resolved path (after symlinks) must stay under the canonical directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PromptError;
use crate::models::CatalogEntry;

const SECTION_SEPARATOR: &str = "\n\n";
const FALLBACK_LANGUAGE: &str = "en";
const EXAMPLES_SUFFIX: &str = "_examples.txt";

/// Templates `validate()` requires.
pub const REQUIRED_TEMPLATES: &[&str] = &[
    "single_item_system_prompt.txt",
    "multi_item_system_prompt.txt",
    "single_item_task_template.txt",
    "multi_item_task_template.txt",
    "categories_context.txt",
    "en_examples.txt",
    "ambiguous_mappings.txt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    SingleItem,
    MultiItem,
    LanguageDetect,
    ProductListDetect,
    Translate,
    BatchTranslate,
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    dir: PathBuf,
}

impl PromptAssembler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build a prompt.
    ///
    /// `lang_tag` is the submission language for item prompts and the target
    /// locale for the translation kinds. For [`PromptKind::BatchTranslate`]
    /// `user_text` holds one item per line; prefer
    /// [`build_batch_translation`](Self::build_batch_translation).
    pub fn build(
        &self,
        kind: PromptKind,
        user_text: &str,
        lang_tag: &str,
        catalog: &[CatalogEntry],
    ) -> Result<String, PromptError> {
        match kind {
            PromptKind::SingleItem => self.build_item_prompt(false, user_text, lang_tag, &[]),
            PromptKind::MultiItem => self.build_item_prompt(true, user_text, lang_tag, catalog),
            PromptKind::LanguageDetect => {
                let template = self.load_template("language_detection_prompt.txt")?;
                Ok(template.replace("{text}", user_text))
            }
            PromptKind::ProductListDetect => {
                let template = self.load_template("product_list_detection_prompt.txt")?;
                Ok(template.replace("{text}", user_text))
            }
            PromptKind::Translate => self.build_translation(user_text, "auto", lang_tag),
            PromptKind::BatchTranslate => {
                let items: Vec<String> = user_text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                self.build_batch_translation(&items, lang_tag)
            }
        }
    }

    pub fn build_translation(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, PromptError> {
        let template = self.load_template("translation_prompt.txt")?;
        Ok(template
            .replace("{source_language}", source_language)
            .replace("{target_language}", target_language)
            .replace("{text}", text))
    }

    /// Items are rendered as a JSON array so quotes and commas inside names
    /// survive.
    pub fn build_batch_translation(
        &self,
        items: &[String],
        target_locale: &str,
    ) -> Result<String, PromptError> {
        let template = self.load_template("batch_translation_prompt.txt")?;
        let rendered = serde_json::to_string_pretty(items).unwrap_or_else(|_| items.join("\n"));
        Ok(template
            .replace("{target_locale}", target_locale)
            .replace("{items}", &rendered))
    }

    fn build_item_prompt(
        &self,
        multi: bool,
        user_text: &str,
        lang_tag: &str,
        catalog: &[CatalogEntry],
    ) -> Result<String, PromptError> {
        let (system_name, task_name) = if multi {
            ("multi_item_system_prompt.txt", "multi_item_task_template.txt")
        } else {
            ("single_item_system_prompt.txt", "single_item_task_template.txt")
        };

        let mut system = self.load_template(system_name)?;
        if multi && !catalog.is_empty() {
            system.push_str(SECTION_SEPARATOR);
            system.push_str(render_catalog(catalog, lang_tag).trim_end());
        }

        let categories = self.load_template("categories_context.txt")?;
        let examples = if multi {
            self.multi_item_examples(lang_tag)?
        } else {
            self.load_template(&examples_file(lang_tag))?
        };
        let ambiguous = self.load_template("ambiguous_mappings.txt")?;

        let language_code = if lang_tag.is_empty() { "auto" } else { lang_tag };
        // Language first so placeholders inside user text are left alone.
        let task = self
            .load_template(task_name)?
            .replace("{language_code}", language_code)
            .replace("{raw_text}", user_text);

        Ok([system, categories, examples, ambiguous, task].join(SECTION_SEPARATOR))
    }

    /// Examples for the multi-item prompt: the requested language, else
    /// English; with no language, every available example file.
    fn multi_item_examples(&self, lang_tag: &str) -> Result<String, PromptError> {
        if lang_tag.is_empty() {
            let sections: Vec<String> = self
                .available_languages()
                .iter()
                .filter_map(|lang| self.load_template(&examples_file(lang)).ok())
                .collect();
            if !sections.is_empty() {
                return Ok(sections.join(SECTION_SEPARATOR));
            }
            return self.load_template(&examples_file(FALLBACK_LANGUAGE));
        }

        match self.load_template(&examples_file(lang_tag)) {
            Ok(examples) => Ok(examples),
            Err(err) => {
                tracing::debug!(lang = lang_tag, error = %err, "no examples for language, using English");
                self.load_template(&examples_file(FALLBACK_LANGUAGE))
            }
        }
    }

    /// Read a template by bare filename, trimmed.
    pub fn load_template(&self, name: &str) -> Result<String, PromptError> {
        let path = self.resolve(name)?;
        let content = fs::read_to_string(&path).map_err(|source| PromptError::TemplateMissing {
            name: name.to_string(),
            source,
        })?;
        Ok(content.trim().to_string())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, PromptError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || Path::new(name).is_absolute()
        {
            return Err(PromptError::InvalidFilename(name.to_string()));
        }

        let path = self.dir.join(name);
        if let (Ok(root), Ok(full)) = (self.dir.canonicalize(), path.canonicalize()) {
            if !full.starts_with(&root) {
                return Err(PromptError::InvalidFilename(name.to_string()));
            }
        }
        Ok(path)
    }

    /// Languages with an `<lang>_examples.txt` file, sorted.
    pub fn available_languages(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut languages: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(EXAMPLES_SUFFIX).map(str::to_string))
            .filter(|lang| !lang.is_empty())
            .collect();
        languages.sort();
        languages
    }

    /// Check that every required template exists and is readable.
    pub fn validate(&self) -> Result<(), PromptError> {
        for name in REQUIRED_TEMPLATES {
            self.load_template(name)?;
        }
        Ok(())
    }
}

fn examples_file(lang: &str) -> String {
    format!("{}{}", lang, EXAMPLES_SUFFIX)
}

/// Render the product reference block for a multi-item prompt.
///
/// Categories keep first-seen order. Each entry becomes
/// `• primary (also: alt, ...) [subcategory → category]`, where the primary
/// name is the entry's name in `lang` (falling back to English) and the
/// alternates are its other names and aliases, de-duplicated.
pub fn render_catalog(entries: &[CatalogEntry], lang: &str) -> String {
    let mut groups: Vec<(&str, Vec<&CatalogEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(cat, _)| *cat == entry.category) {
            Some((_, members)) => members.push(entry),
            None => groups.push((entry.category.as_str(), vec![entry])),
        }
    }

    let mut out = String::new();
    out.push_str("IMPORTANT - PRODUCT REFERENCE TABLE:\n");
    out.push_str("Use ONLY the standardized product names from this table. ");
    out.push_str("Match user input to the closest product. ");
    out.push_str("Answer in the language of the user's input: do NOT translate product names into another language.\n\n");

    for (category, members) in groups {
        out.push_str(&format!("=== {} ===\n", category));
        for entry in members {
            let primary = entry.name_for(lang).unwrap_or(&entry.name_en);

            let mut alternates: Vec<&str> = Vec::new();
            for alt in entry
                .names()
                .into_iter()
                .chain(entry.aliases.iter().map(String::as_str))
            {
                let alt = alt.trim();
                if !alt.is_empty() && alt != primary && !alternates.contains(&alt) {
                    alternates.push(alt);
                }
            }

            out.push_str(&format!("• {}", primary));
            if !alternates.is_empty() {
                out.push_str(&format!(" (also: {})", alternates.join(", ")));
            }
            out.push_str(&format!(" [{} → {}]\n", entry.subcategory, entry.category));
        }
        out.push('\n');
    }

    out.push_str("MATCHING RULES:\n");
    out.push_str("1. Input naming several products ('морква филе') becomes separate items ('морковка', 'куриное филе')\n");
    out.push_str("2. Use the EXACT standardized name from the table, don't modify it\n");
    out.push_str("3. If input doesn't match any product, use the closest match with lower confidence\n");
    out.push_str("4. Consider aliases when matching (e.g., 'филе' matches 'куриное филе')\n");
    out.push_str("5. Repeated products ('кролик, кролик') become ONE item, not duplicates\n");
    out
}
