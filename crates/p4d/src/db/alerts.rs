use anyhow::{Context, Result};

use super::Db;

/// One row of `sensoralert`. Rules chain through `subid`; `lgop` combines
/// this rule's verdict with the next one in the chain.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorAlertRule {
    pub id: i64,
    pub kind: String,
    pub subid: Option<i64>,
    pub lgop: Option<String>,
    #[sqlx(rename = "type")]
    pub value_type: String,
    pub address: i64,
    pub state: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub rangem: Option<i64>,
    pub delta: Option<i64>,
    pub maxrepeat: i64,
    pub lastalert: i64,
    pub mailto: String,
    pub msubject: String,
    pub mbody: String,
}

const RULE_COLUMNS: &str = "id, kind, subid, lgop, type, address, state, min, max, rangem, \
     delta, maxrepeat, lastalert, mailto, msubject, mbody";

impl Db {
    /// Active mail rules that are not the sub-rule of another rule.
    pub async fn top_level_alert_rules(&self) -> Result<Vec<SensorAlertRule>> {
        let sql = format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM sensoralert
            WHERE state = 'A' AND kind = 'M'
              AND id NOT IN (SELECT subid FROM sensoralert WHERE subid IS NOT NULL)
            ORDER BY id
            "#
        );
        sqlx::query_as::<_, SensorAlertRule>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("top_level_alert_rules failed")
    }

    pub async fn alert_rule(&self, id: i64) -> Result<Option<SensorAlertRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM sensoralert WHERE id = ?");
        sqlx::query_as::<_, SensorAlertRule>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("alert_rule failed")
    }

    pub async fn stamp_alert_rule(&self, id: i64, at: i64) -> Result<()> {
        sqlx::query("UPDATE sensoralert SET lastalert = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("stamp_alert_rule failed")?;
        Ok(())
    }
}

#[cfg(test)]
impl Db {
    pub async fn insert_alert_rule(&self, r: &SensorAlertRule) -> Result<()> {
        let sql = format!(
            "INSERT INTO sensoralert ({RULE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(r.id)
            .bind(&r.kind)
            .bind(r.subid)
            .bind(&r.lgop)
            .bind(&r.value_type)
            .bind(r.address)
            .bind(&r.state)
            .bind(r.min)
            .bind(r.max)
            .bind(r.rangem)
            .bind(r.delta)
            .bind(r.maxrepeat)
            .bind(r.lastalert)
            .bind(&r.mailto)
            .bind(&r.msubject)
            .bind(&r.mbody)
            .execute(&self.pool)
            .await
            .context("insert_alert_rule failed")?;
        Ok(())
    }
}
