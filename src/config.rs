//! Configuração do DC-API carregada a partir de um arquivo TOML.
//!
//! A struct [`DcConfig`] contém todos os parâmetros configuráveis do master.
//! Valores não presentes no arquivo usam defaults sensíveis; a única chave
//! obrigatória é `work_dir`. A variável de ambiente `DCAPI_WORK_DIR` tem
//! precedência sobre o arquivo.
//!
//! Chaves desconhecidas são preservadas em [`DcConfig::extra`] e podem ser
//! consultadas como um mapa opaco chave→valor via [`DcConfig::get_str`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::BackendKind;
use crate::error::DcError;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const DEFAULT_CONFIG_FILE: &str = "dcapi.toml";

/// Configuração de nível superior carregada de `dcapi.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DcConfig {
    /// Diretório raiz onde cada WU recebe seu diretório de trabalho.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Backend de execução selecionado em tempo de execução.
    #[serde(default)]
    pub backend: BackendKind,

    /// Intervalo entre varreduras do poller, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Número máximo de WUs vivos ao mesmo tempo.
    #[serde(default = "default_max_workunits")]
    pub max_workunits: usize,

    /// Tamanho da janela de verificações de status executadas em paralelo.
    #[serde(default = "default_status_workers")]
    pub status_workers: usize,

    /// Tamanho máximo de uma mensagem master↔cliente, em bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Tempo limite para cada comando externo invocado por um driver.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub condor: CondorConfig,

    #[serde(default)]
    pub clustergrid: ClusterGridConfig,

    #[serde(default)]
    pub boinc: BoincConfig,

    /// Chaves não reconhecidas, expostas como consulta opaca.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Binários e parâmetros do backend Condor.
#[derive(Debug, Clone, Deserialize)]
pub struct CondorConfig {
    #[serde(default = "default_condor_submit")]
    pub submit_bin: String,
    #[serde(default = "default_condor_rm")]
    pub rm_bin: String,
    #[serde(default = "default_condor_hold")]
    pub hold_bin: String,
    #[serde(default = "default_condor_release")]
    pub release_bin: String,
    #[serde(default = "default_condor_universe")]
    pub universe: String,
}

/// Binários do broker ClusterGrid.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterGridConfig {
    #[serde(default = "default_clgr_submit")]
    pub submit_bin: String,
    #[serde(default = "default_clgr_status")]
    pub status_bin: String,
    #[serde(default = "default_clgr_getout")]
    pub getout_bin: String,
    #[serde(default = "default_clgr_rm")]
    pub rm_bin: String,
}

/// Layout do projeto BOINC usado pelo backend nativo.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoincConfig {
    /// Raiz do projeto BOINC; obrigatória quando `backend = "boinc"`.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Caminho do `create_work`, relativo à raiz do projeto.
    #[serde(default)]
    pub create_work_bin: Option<String>,
    /// Caminho do `cancel_jobs`, relativo à raiz do projeto.
    #[serde(default)]
    pub cancel_bin: Option<String>,
    /// Diretório onde os arquivos de entrada são publicados.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Diretório onde o assimilador deposita os resultados.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    #[serde(default)]
    pub wu_template: Option<String>,
    #[serde(default)]
    pub result_template: Option<String>,
}

// Valor padrão do intervalo de varredura: 1000ms.
fn default_poll_interval_ms() -> u64 {
    1000
}

// Valor padrão da capacidade: 1024 WUs.
fn default_max_workunits() -> usize {
    1024
}

// Valor padrão da janela de workers: 4.
fn default_status_workers() -> usize {
    4
}

// Valor padrão do tamanho de mensagem: 16 KiB.
fn default_max_message_size() -> usize {
    16 * 1024
}

// Valor padrão do timeout de comandos: 60s.
fn default_command_timeout_secs() -> u64 {
    60
}

fn default_condor_submit() -> String {
    "condor_submit".to_string()
}

fn default_condor_rm() -> String {
    "condor_rm".to_string()
}

fn default_condor_hold() -> String {
    "condor_hold".to_string()
}

fn default_condor_release() -> String {
    "condor_release".to_string()
}

fn default_condor_universe() -> String {
    "vanilla".to_string()
}

fn default_clgr_submit() -> String {
    "clgr_submit".to_string()
}

fn default_clgr_status() -> String {
    "clgr_status".to_string()
}

fn default_clgr_getout() -> String {
    "clgr_getout".to_string()
}

fn default_clgr_rm() -> String {
    "clgr_rm".to_string()
}

impl Default for CondorConfig {
    fn default() -> Self {
        Self {
            submit_bin: default_condor_submit(),
            rm_bin: default_condor_rm(),
            hold_bin: default_condor_hold(),
            release_bin: default_condor_release(),
            universe: default_condor_universe(),
        }
    }
}

impl Default for ClusterGridConfig {
    fn default() -> Self {
        Self {
            submit_bin: default_clgr_submit(),
            status_bin: default_clgr_status(),
            getout_bin: default_clgr_getout(),
            rm_bin: default_clgr_rm(),
        }
    }
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            backend: BackendKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_workunits: default_max_workunits(),
            status_workers: default_status_workers(),
            max_message_size: default_max_message_size(),
            command_timeout_secs: default_command_timeout_secs(),
            condor: CondorConfig::default(),
            clustergrid: ClusterGridConfig::default(),
            boinc: BoincConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl DcConfig {
    /// Carrega a configuração do caminho fornecido, ou de `dcapi.toml` no
    /// diretório atual quando nenhum caminho é dado.
    ///
    /// Um caminho explícito inexistente é erro; o arquivo padrão ausente
    /// resulta nos valores padrão. A configuração não é validada aqui.
    pub fn load(path: Option<&Path>) -> Result<Self, DcError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    DcError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&contents)?
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    let contents = std::fs::read_to_string(default_path)
                        .map_err(|e| DcError::Config(format!("cannot read {DEFAULT_CONFIG_FILE}: {e}")))?;
                    Self::from_toml_str(&contents)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo para o diretório de trabalho.
        if let Ok(dir) = std::env::var("DCAPI_WORK_DIR")
            && !dir.is_empty()
        {
            config.work_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Interpreta o conteúdo TOML, convertendo erros de sintaxe em erros de configuração.
    pub fn from_toml_str(contents: &str) -> Result<Self, DcError> {
        toml::from_str::<DcConfig>(contents).map_err(|e| DcError::Config(e.to_string()))
    }

    /// Verifica as chaves obrigatórias. Falhas aqui são fatais em `init`.
    pub fn validate(&self) -> Result<(), DcError> {
        if self.work_dir.is_none() {
            return Err(DcError::Config("missing required key `work_dir`".into()));
        }
        if self.status_workers == 0 {
            return Err(DcError::Config("`status_workers` must be at least 1".into()));
        }
        if self.max_workunits == 0 {
            return Err(DcError::Config("`max_workunits` must be at least 1".into()));
        }
        if self.backend == BackendKind::Boinc && self.boinc.project_root.is_none() {
            return Err(DcError::Config(
                "missing required key `boinc.project_root` for the boinc backend".into(),
            ));
        }
        Ok(())
    }

    /// Diretório raiz de trabalho. Só deve ser chamado após [`validate`](Self::validate).
    pub fn work_root(&self) -> Result<&Path, DcError> {
        self.work_dir
            .as_deref()
            .ok_or_else(|| DcError::Config("missing required key `work_dir`".into()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Consulta opaca de uma chave não tipada. Aceita chaves com pontos
    /// (`"app.input_url"`) para navegar em tabelas aninhadas.
    pub fn get_str(&self, key: &str) -> Option<String> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut value = self.extra.get(first)?;
        for part in parts {
            value = value.as_table()?.get(part)?;
        }
        match value {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Como [`get_str`](Self::get_str), mas interpreta o valor como inteiro.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_str(key)?.trim().parse().ok()
    }
}
