use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const APP_DIR: &str = "bite";

/// 接続ごとの設定キャッシュの抽象化トレイト
#[async_trait]
pub trait SettingsCache: Send + Sync {
    /// 値を取得
    fn get(&self, key: &str) -> Option<&str>;

    /// 値を設定（保存は`save`で行う）
    fn set(&mut self, key: &str, value: &str);

    /// 値を削除
    fn remove(&mut self, key: &str) -> Option<String>;

    /// 全ての値を削除
    fn clear(&mut self);

    /// 永続化先から読み込み
    async fn load(&mut self) -> Result<()>;

    /// 永続化先へ書き込み
    async fn save(&self) -> Result<()>;
}

/// `<cache dir>/bite/<connection>.json` に保存するファイルキャッシュ
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            values: BTreeMap::new(),
        }
    }

    /// デフォルトのキャッシュディレクトリで接続用のキャッシュを作成
    pub fn for_connection(connection: &str) -> Result<Self> {
        Ok(Self::new(cache_dir()?.join(format!("{}.json", file_stem(connection)))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl SettingsCache for FileCache {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    async fn load(&mut self) -> Result<()> {
        self.values = read_json(&self.path).await?.unwrap_or_default();
        debug!(path = %self.path.display(), entries = self.values.len(), "loaded settings cache");
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        if self.values.is_empty() {
            // 空のキャッシュはファイルごと削除
            return remove_file(&self.path).await.map(|_| ());
        }
        write_json(&self.path, &self.values).await
    }
}

/// 接続ごとに保存される認証トークン
#[derive(Debug, Clone)]
pub struct AuthStore {
    path: PathBuf,
}

impl AuthStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn for_connection(connection: &str) -> Result<Self> {
        Ok(Self::new(cache_dir()?.join(format!("{}.auth", file_stem(connection)))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(token) => Ok(Some(token.trim().to_string()).filter(|t| !t.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub async fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&self.path).await?;
        file.write_all(token.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// トークンを破棄。存在しなかった場合は`false`
    pub async fn remove(&self) -> Result<bool> {
        let removed = remove_file(&self.path).await?;
        if removed {
            warn!(path = %self.path.display(), "removed stored auth token");
        }
        Ok(removed)
    }
}

fn cache_dir() -> Result<PathBuf> {
    Ok(dirs::cache_dir()
        .ok_or_else(|| Error::Config("cache directory not found".to_string()))?
        .join(APP_DIR))
}

/// 接続名をファイル名として安全な形に変換
fn file_stem(connection: &str) -> String {
    connection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

async fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

async fn write_json<T: Serialize + Sync>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(data)?;
    let mut file = fs::File::create(path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&contents)?))
}
