//! 存储模块：代理、历史成绩与分类结果的 SQLite 读写。
//!
//! 连接池固定为 1 个连接：SQLite 同一时刻只有一个写者，
//! 多连接只会在文件锁层面互相排队。配合 WAL 模式保证并发读。

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use crate::error::CoreError;
use crate::model::{Category, PerformanceRecord, ProxyRecord};

#[derive(Debug, Clone)]
pub struct ProxyStore {
    pool: Pool<Sqlite>,
}

impl ProxyStore {
    pub async fn connect(path: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(CoreError::SQLError)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        info!("✅ 数据库连接成功：{}", path);
        Ok(store)
    }

    /// 测试用内存库。
    pub async fn connect_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                fingerprint TEXT PRIMARY KEY,
                raw TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                address TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL DEFAULT 0,
                entry_ip TEXT NOT NULL DEFAULT '',
                entry_isp TEXT NOT NULL DEFAULT '',
                entry_country TEXT NOT NULL DEFAULT '',
                ip TEXT NOT NULL DEFAULT '',
                isp TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL DEFAULT '',
                is_dirty INTEGER NOT NULL DEFAULT 0,
                is_rotating INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performances (
                fingerprint TEXT NOT NULL,
                observer_isp TEXT NOT NULL,
                score REAL NOT NULL DEFAULT 0.0,
                sample_count INTEGER NOT NULL DEFAULT 0,
                last_tested_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, observer_isp)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS categories (name TEXT PRIMARY KEY);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS category_members (
                category_name TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                PRIMARY KEY (category_name, fingerprint)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 批量入库，指纹冲突时跳过（同一端点的重复抄写只记一次）。
    /// 返回实际插入的条数。
    pub async fn insert_proxies(&self, batch: &[ProxyRecord]) -> Result<u64, CoreError> {
        let mut inserted = 0u64;
        for p in batch {
            let result = sqlx::query(
                r#"
                INSERT INTO proxies (fingerprint, raw, source, created_at, address, port)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(fingerprint) DO NOTHING
                "#,
            )
            .bind(&p.fingerprint)
            .bind(&p.raw)
            .bind(&p.source)
            .bind(p.created_at)
            .bind(&p.address)
            .bind(p.port)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn find_proxy(&self, fingerprint: &str) -> Result<Option<ProxyRecord>, CoreError> {
        let proxy =
            sqlx::query_as::<_, ProxyRecord>("SELECT * FROM proxies WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(proxy)
    }

    pub async fn all_proxies(&self) -> Result<Vec<ProxyRecord>, CoreError> {
        let proxies = sqlx::query_as::<_, ProxyRecord>("SELECT * FROM proxies")
            .fetch_all(&self.pool)
            .await?;
        Ok(proxies)
    }

    pub async fn count_proxies(&self) -> Result<i64, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    /// 刷新探测得到的出入口元数据。
    pub async fn update_metadata(&self, p: &ProxyRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE proxies SET
                entry_ip = ?, entry_isp = ?, entry_country = ?,
                ip = ?, isp = ?, country = ?,
                is_dirty = ?, is_rotating = ?
            WHERE fingerprint = ?
            "#,
        )
        .bind(&p.entry_ip)
        .bind(&p.entry_isp)
        .bind(&p.entry_country)
        .bind(&p.ip)
        .bind(&p.isp)
        .bind(&p.country)
        .bind(p.is_dirty)
        .bind(p.is_rotating)
        .bind(&p.fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_performance(
        &self,
        fingerprint: &str,
        observer_isp: &str,
    ) -> Result<Option<PerformanceRecord>, CoreError> {
        let perf = sqlx::query_as::<_, PerformanceRecord>(
            "SELECT * FROM performances WHERE fingerprint = ? AND observer_isp = ?",
        )
        .bind(fingerprint)
        .bind(observer_isp)
        .fetch_optional(&self.pool)
        .await?;
        Ok(perf)
    }

    /// 其他观测网络下的平均分，冷启动外推用。
    pub async fn avg_score_other_isps(
        &self,
        fingerprint: &str,
        observer_isp: &str,
    ) -> Result<Option<f64>, CoreError> {
        let row = sqlx::query(
            "SELECT AVG(score) AS avg_score FROM performances WHERE fingerprint = ? AND observer_isp != ?",
        )
        .bind(fingerprint)
        .bind(observer_isp)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("avg_score"))
    }

    pub async fn upsert_performance(&self, perf: &PerformanceRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO performances (fingerprint, observer_isp, score, sample_count, last_tested_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint, observer_isp) DO UPDATE SET
                score = excluded.score,
                sample_count = excluded.sample_count,
                last_tested_at = excluded.last_tested_at
            "#,
        )
        .bind(&perf.fingerprint)
        .bind(&perf.observer_isp)
        .bind(perf.score)
        .bind(perf.sample_count)
        .bind(perf.last_tested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 原子替换分类成员：旧成员全部清除，写入新名单。
    pub async fn replace_category(
        &self,
        name: &str,
        fingerprints: &[String],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO categories (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM category_members WHERE category_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        for fp in fingerprints {
            sqlx::query("INSERT OR IGNORE INTO category_members (category_name, fingerprint) VALUES (?, ?)")
                .bind(name)
                .bind(fp)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// 读取分类及其成员。names 为空时返回全部分类。
    pub async fn load_categories(&self, names: &[String]) -> Result<Vec<Category>, CoreError> {
        let cat_names: Vec<String> = if names.is_empty() {
            sqlx::query("SELECT name FROM categories ORDER BY name")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.get("name"))
                .collect()
        } else {
            names.to_vec()
        };

        let mut categories = Vec::with_capacity(cat_names.len());
        for name in cat_names {
            let members = sqlx::query_as::<_, ProxyRecord>(
                r#"
                SELECT p.* FROM proxies p
                JOIN category_members m ON m.fingerprint = p.fingerprint
                WHERE m.category_name = ?
                "#,
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;
            categories.push(Category { name, members });
        }
        Ok(categories)
    }

    /// 删除一批代理及其关联的历史与分类成员。
    pub async fn delete_proxies(&self, fingerprints: &[String]) -> Result<u64, CoreError> {
        if fingerprints.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; fingerprints.len()].join(", ");
        let mut tx = self.pool.begin().await?;

        let sql = format!("DELETE FROM proxies WHERE fingerprint IN ({})", placeholders);
        let mut q = sqlx::query(&sql);
        for fp in fingerprints {
            q = q.bind(fp);
        }
        let deleted = q.execute(&mut *tx).await?.rows_affected();

        let sql = format!(
            "DELETE FROM performances WHERE fingerprint IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for fp in fingerprints {
            q = q.bind(fp);
        }
        q.execute(&mut *tx).await?;

        let sql = format!(
            "DELETE FROM category_members WHERE fingerprint IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for fp in fingerprints {
            q = q.bind(fp);
        }
        q.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(deleted)
    }

    /// 状态面板统计：各分类成员数。
    pub async fn category_counts(&self) -> Result<Vec<(String, i64)>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.name AS name, COUNT(m.fingerprint) AS cnt
            FROM categories c
            LEFT JOIN category_members m ON m.category_name = c.name
            GROUP BY c.name ORDER BY c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("cnt")))
            .collect())
    }

    /// 状态面板统计：出口国家 Top N。
    pub async fn top_countries(&self, limit: u32) -> Result<Vec<(String, i64)>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT country, COUNT(*) AS cnt FROM proxies
            WHERE country != ''
            GROUP BY country ORDER BY cnt DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("country"), row.get("cnt")))
            .collect())
    }

    pub async fn raw_links(&self) -> Result<Vec<String>, CoreError> {
        let rows = sqlx::query("SELECT raw FROM proxies")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("raw")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(fp: &str) -> ProxyRecord {
        ProxyRecord::new(
            fp.to_string(),
            format!("trojan://pw@{}.example:443", fp),
            "test".to_string(),
            format!("{}.example", fp),
            443,
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_fingerprint() {
        let store = ProxyStore::connect_memory().await.unwrap();
        let batch = vec![sample("a"), sample("b")];

        assert_eq!(store.insert_proxies(&batch).await.unwrap(), 2);
        // 第二次插入同一批：冲突全部跳过
        assert_eq!(store.insert_proxies(&batch).await.unwrap(), 0);
        assert_eq!(store.count_proxies().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cosmetic_variants_collapse_to_one_record() {
        let store = ProxyStore::connect_memory().await.unwrap();

        // 同一端点的两种抄写：只有 fp/sni/remarks 不同
        let uris = [
            "vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&fp=chrome&sni=a.com#Label1",
            "vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&fp=firefox&sni=b.com#Label2",
        ];

        let batch: Vec<ProxyRecord> = uris
            .iter()
            .map(|raw| {
                let profile = crate::parser::parse(raw).unwrap();
                ProxyRecord::new(
                    profile.fingerprint_hash(),
                    raw.to_string(),
                    "test".into(),
                    profile.address.clone(),
                    profile.port,
                )
            })
            .collect();

        let inserted = store.insert_proxies(&batch).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.count_proxies().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_metadata_update_roundtrip() {
        let store = ProxyStore::connect_memory().await.unwrap();
        store.insert_proxies(&[sample("a")]).await.unwrap();

        let mut p = store.find_proxy("a").await.unwrap().unwrap();
        p.isp = "ISP-B".into();
        p.country = "DE".into();
        p.is_rotating = true;
        store.update_metadata(&p).await.unwrap();

        let got = store.find_proxy("a").await.unwrap().unwrap();
        assert_eq!(got.isp, "ISP-B");
        assert_eq!(got.country, "DE");
        assert!(got.is_rotating);
    }

    #[tokio::test]
    async fn test_performance_composite_key() {
        let store = ProxyStore::connect_memory().await.unwrap();
        let perf = PerformanceRecord {
            fingerprint: "a".into(),
            observer_isp: "ISP-X".into(),
            score: 0.8,
            sample_count: 1,
            last_tested_at: Utc::now(),
        };
        store.upsert_performance(&perf).await.unwrap();

        let other = PerformanceRecord {
            observer_isp: "ISP-Y".into(),
            score: 0.4,
            ..perf.clone()
        };
        store.upsert_performance(&other).await.unwrap();

        let x = store.find_performance("a", "ISP-X").await.unwrap().unwrap();
        assert!((x.score - 0.8).abs() < 1e-9);
        let avg = store.avg_score_other_isps("a", "ISP-Z").await.unwrap().unwrap();
        assert!((avg - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replace_category_is_atomic() {
        let store = ProxyStore::connect_memory().await.unwrap();
        store
            .insert_proxies(&[sample("a"), sample("b"), sample("c")])
            .await
            .unwrap();

        store
            .replace_category("speed", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        store
            .replace_category("speed", &["c".to_string()])
            .await
            .unwrap();

        let cats = store.load_categories(&["speed".to_string()]).await.unwrap();
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].members.len(), 1);
        assert_eq!(cats[0].members[0].fingerprint, "c");
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = ProxyStore::connect_memory().await.unwrap();
        store.insert_proxies(&[sample("a"), sample("b")]).await.unwrap();
        store
            .upsert_performance(&PerformanceRecord {
                fingerprint: "a".into(),
                observer_isp: "X".into(),
                score: 1.0,
                sample_count: 1,
                last_tested_at: Utc::now(),
            })
            .await
            .unwrap();
        store.replace_category("speed", &["a".to_string()]).await.unwrap();

        let deleted = store.delete_proxies(&["a".to_string()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find_performance("a", "X").await.unwrap().is_none());
        let cats = store.load_categories(&["speed".to_string()]).await.unwrap();
        assert!(cats[0].members.is_empty());
    }
}
