use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use luca_nls::{Charset, Encoding, TableCharset};
use serde::{Deserialize, Serialize};

use crate::operator::{LucaOperate, MessageTitle, OpcodeTable, OperatorSet};

/// Opcode order used when a title does not ship its own table.
pub const DEFAULT_OPCODES: &[&str] = &[
    "EQU", "ADD", "IFN", "IFY", "GOTO", "JUMP", "FARCALL", "FARRETURN", "END", "MESSAGE",
];

/// How a title encodes strings: a standard encoding, or a `.tbl` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharsetSpec {
    ShiftJis,
    Gbk,
    Gb18030,
    Utf8,
    #[serde(rename = "utf16le")]
    Utf16Le,
    Table(PathBuf),
}

impl CharsetSpec {
    /// Relative table paths resolve against `base_dir`.
    pub fn load(&self, base_dir: &Path) -> Result<Arc<dyn Charset>> {
        let enc = match self {
            CharsetSpec::ShiftJis => Encoding::ShiftJis,
            CharsetSpec::Gbk => Encoding::Gbk,
            CharsetSpec::Gb18030 => Encoding::Gb18030,
            CharsetSpec::Utf8 => Encoding::Utf8,
            CharsetSpec::Utf16Le => Encoding::Utf16Le,
            CharsetSpec::Table(path) => {
                let path = base_dir.join(path);
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Reading charset table {:?}", path))?;
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "table".to_string());
                let table = TableCharset::parse_tbl(name, &text)
                    .with_context(|| format!("Parsing charset table {:?}", path))?;
                return Ok(Arc::new(table));
            }
        };
        Ok(enc.charset())
    }
}

impl FromStr for CharsetSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sjis" | "shift_jis" | "shift-jis" => CharsetSpec::ShiftJis,
            "gbk" => CharsetSpec::Gbk,
            "gb18030" => CharsetSpec::Gb18030,
            "utf8" | "utf-8" => CharsetSpec::Utf8,
            "utf16le" | "utf-16le" | "unicode" => CharsetSpec::Utf16Le,
            other if other.ends_with(".tbl") => CharsetSpec::Table(PathBuf::from(s)),
            other => bail!("unknown charset {other:?}"),
        })
    }
}

/// Everything that differs between LucaSystem titles.
/// Please use [`TitleConfigBuilder`] to build one from code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleConfig {
    pub name: String,
    /// Expressions and script names.
    pub expr_charset: CharsetSpec,
    /// Dialogue text.
    pub text_charset: CharsetSpec,
    /// Opcode names in id order.
    pub opcodes: Vec<String>,
    /// One opcode name per line; takes precedence over `opcodes`.
    pub opcode_file: Option<PathBuf>,
    /// Number of text strings in a MESSAGE instruction.
    pub message_languages: usize,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            name: "LucaSystem".to_string(),
            expr_charset: CharsetSpec::ShiftJis,
            text_charset: CharsetSpec::Utf16Le,
            opcodes: DEFAULT_OPCODES.iter().map(|s| s.to_string()).collect(),
            opcode_file: None,
            message_languages: 1,
            base_dir: PathBuf::new(),
        }
    }
}

impl TitleConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Parsing title config")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Reading title config {:?}", path))?;
        let mut config = Self::from_toml_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn opcode_table(&self) -> Result<OpcodeTable> {
        match &self.opcode_file {
            Some(file) => {
                let path = self.base_dir.join(file);
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Reading opcode table {:?}", path))?;
                Ok(OpcodeTable::parse(&text))
            }
            None => Ok(OpcodeTable::from_names(&self.opcodes)),
        }
    }

    pub fn operate(&self) -> Result<LucaOperate> {
        Ok(LucaOperate::new(
            self.expr_charset.load(&self.base_dir)?,
            self.text_charset.load(&self.base_dir)?,
        ))
    }

    /// The title's dispatch table: baseline handlers plus its MESSAGE.
    pub fn operator_set(&self) -> Result<OperatorSet> {
        let env = self.operate()?;
        let title = MessageTitle {
            languages: self.message_languages,
        };
        let ops = OperatorSet::builder(self.opcode_table()?)
            .baseline(&env)
            .title(&title, &env)
            .build();
        log::debug!("{}: {} opcode handler(s)", self.name, ops.len());
        Ok(ops)
    }
}

/// `TitleConfigBuilder` is a convenience builder to create a `TitleConfig` from code.
#[derive(Default)]
pub struct TitleConfigBuilder {
    config: TitleConfig,
}

impl TitleConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn with_expr_charset(mut self, charset: CharsetSpec) -> Self {
        self.config.expr_charset = charset;
        self
    }

    pub fn with_text_charset(mut self, charset: CharsetSpec) -> Self {
        self.config.text_charset = charset;
        self
    }

    pub fn with_opcodes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.opcodes = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_opcode_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.opcode_file = Some(path.into());
        self
    }

    pub fn with_message_languages(mut self, languages: usize) -> Self {
        self.config.message_languages = languages;
        self
    }

    /// Directory relative paths resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = dir.into();
        self
    }

    pub fn get(self) -> TitleConfig {
        self.config
    }
}
