use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

/// Single connection shared across async tasks; rusqlite connections are
/// not Sync, so all access goes through the mutex.
pub type SharedConn = Arc<tokio::sync::Mutex<Connection>>;

/// Open the database, creating the parent directory on first use.
pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS processos (
            id                    INTEGER PRIMARY KEY,
            numero                TEXT UNIQUE NOT NULL,
            tipo                  TEXT NOT NULL DEFAULT '',
            interessado           TEXT NOT NULL DEFAULT '',
            data_geracao          TEXT,
            source_url            TEXT,
            -- user annotations, never touched by import
            assunto               TEXT,
            concessionaria        TEXT,
            titulo                TEXT,
            tipo_custom           TEXT,
            -- derived from andamentos
            ultima_unidade        TEXT,
            data_ultimo_andamento TEXT,
            created_at            TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at            TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS protocolos (
            id           INTEGER PRIMARY KEY,
            processo_id  INTEGER NOT NULL REFERENCES processos(id) ON DELETE CASCADE,
            numero       TEXT NOT NULL,
            tipo         TEXT NOT NULL DEFAULT '',
            data         TEXT,
            data_inclusao TEXT,
            unidade      TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(processo_id, numero)
        );
        CREATE INDEX IF NOT EXISTS idx_protocolos_processo ON protocolos(processo_id);

        CREATE TABLE IF NOT EXISTS andamentos (
            id           INTEGER PRIMARY KEY,
            processo_id  INTEGER NOT NULL REFERENCES processos(id) ON DELETE CASCADE,
            data_hora    TEXT,
            unidade      TEXT,
            descricao    TEXT NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        -- COALESCE keeps NULL columns from defeating the dedup invariant
        CREATE UNIQUE INDEX IF NOT EXISTS idx_andamentos_dedup
            ON andamentos(processo_id, COALESCE(data_hora,''), COALESCE(unidade,''), descricao);
        CREATE INDEX IF NOT EXISTS idx_andamentos_processo ON andamentos(processo_id);

        CREATE TABLE IF NOT EXISTS schedules (
            id             INTEGER PRIMARY KEY CHECK (id = 1),
            mode           TEXT NOT NULL DEFAULT 'manual' CHECK (mode IN ('manual','scheduled')),
            type           TEXT CHECK (type IN ('daily','interval')),
            daily_time     TEXT,
            interval_hours INTEGER,
            next_run       TEXT,
            updated_at     TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Processos ──

pub struct ProcessoUpsert {
    pub numero: String,
    pub tipo: String,
    pub interessado: String,
    pub data_geracao: Option<String>,
    pub source_url: Option<String>,
}

/// Insert-or-update keyed by numero. Scraped fields overwrite, nullable
/// fields coalesce (an existing value is never replaced by NULL).
pub fn upsert_processo(conn: &Connection, input: &ProcessoUpsert) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "INSERT INTO processos (numero, tipo, interessado, data_geracao, source_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(numero) DO UPDATE SET
               tipo = excluded.tipo,
               interessado = excluded.interessado,
               data_geracao = COALESCE(excluded.data_geracao, processos.data_geracao),
               source_url = COALESCE(excluded.source_url, processos.source_url),
               updated_at = datetime('now')
             RETURNING id",
            rusqlite::params![
                input.numero,
                input.tipo,
                input.interessado,
                input.data_geracao,
                input.source_url,
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn find_processo_id(conn: &Connection, numero: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM processos WHERE numero = ?1 LIMIT 1",
            [numero],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub struct ProcessoRow {
    pub id: i64,
    pub numero: String,
    pub tipo: String,
    pub interessado: String,
    pub data_geracao: Option<String>,
    pub source_url: Option<String>,
    pub ultima_unidade: Option<String>,
    pub data_ultimo_andamento: Option<String>,
}

pub fn get_processo_by_numero(conn: &Connection, numero: &str) -> Result<Option<ProcessoRow>> {
    let row = conn
        .query_row(
            "SELECT id, numero, tipo, interessado, data_geracao, source_url,
                    ultima_unidade, data_ultimo_andamento
             FROM processos WHERE numero = ?1",
            [numero],
            |row| {
                Ok(ProcessoRow {
                    id: row.get(0)?,
                    numero: row.get(1)?,
                    tipo: row.get(2)?,
                    interessado: row.get(3)?,
                    data_geracao: row.get(4)?,
                    source_url: row.get(5)?,
                    ultima_unidade: row.get(6)?,
                    data_ultimo_andamento: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub struct ProcessoSource {
    pub id: i64,
    pub numero: String,
    pub source_url: String,
}

/// Feed for the batch driver: every parent with a stored fetch origin.
pub fn list_processos_with_source(conn: &Connection) -> Result<Vec<ProcessoSource>> {
    let mut stmt = conn.prepare(
        "SELECT id, numero, source_url FROM processos
         WHERE source_url IS NOT NULL
         ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProcessoSource {
                id: row.get(0)?,
                numero: row.get(1)?,
                source_url: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Children ──

pub struct ProtocoloInsert {
    pub numero: String,
    pub tipo: String,
    pub data: Option<String>,
    pub data_inclusao: Option<String>,
    pub unidade: Option<String>,
}

/// Bulk insert with conflict-skip; returns the genuinely-new row count.
pub fn insert_protocolos(
    conn: &Connection,
    processo_id: i64,
    items: &[ProtocoloInsert],
) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO protocolos (processo_id, numero, tipo, data, data_inclusao, unidade)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for item in items {
            inserted += stmt.execute(rusqlite::params![
                processo_id,
                item.numero,
                item.tipo,
                item.data,
                item.data_inclusao,
                item.unidade,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

pub struct AndamentoInsert {
    pub data_hora: Option<String>,
    pub unidade: Option<String>,
    pub descricao: String,
}

pub fn insert_andamentos(
    conn: &Connection,
    processo_id: i64,
    items: &[AndamentoInsert],
) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO andamentos (processo_id, data_hora, unidade, descricao)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for item in items {
            inserted += stmt.execute(rusqlite::params![
                processo_id,
                item.data_hora,
                item.unidade,
                item.descricao,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Recompute the parent's derived fields from its timeline: latest
/// timestamp and the unit on that entry, ties broken by insertion recency.
/// Leaves existing values alone when the parent has no dated andamentos.
pub fn refresh_derivados(conn: &Connection, processo_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE processos SET
           data_ultimo_andamento =
             (SELECT date(MAX(data_hora)) FROM andamentos WHERE processo_id = ?1),
           ultima_unidade =
             (SELECT unidade FROM andamentos
              WHERE processo_id = ?1
                AND data_hora = (SELECT MAX(data_hora) FROM andamentos WHERE processo_id = ?1)
              ORDER BY id DESC LIMIT 1),
           updated_at = datetime('now')
         WHERE id = ?1
           AND EXISTS (SELECT 1 FROM andamentos WHERE processo_id = ?1 AND data_hora IS NOT NULL)",
        [processo_id],
    )?;
    Ok(())
}

// ── Schedules ──

#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub mode: String,
    pub schedule_type: Option<String>,
    pub daily_time: Option<String>,
    pub interval_hours: Option<i64>,
    pub next_run: Option<String>,
}

/// The schedule is a singleton row; saving replaces the whole config.
pub fn save_schedule(conn: &Connection, input: &ScheduleRow) -> Result<()> {
    conn.execute(
        "INSERT INTO schedules (id, mode, type, daily_time, interval_hours, next_run)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
           mode = excluded.mode,
           type = excluded.type,
           daily_time = excluded.daily_time,
           interval_hours = excluded.interval_hours,
           next_run = excluded.next_run,
           updated_at = datetime('now')",
        rusqlite::params![
            input.mode,
            input.schedule_type,
            input.daily_time,
            input.interval_hours,
            input.next_run,
        ],
    )?;
    Ok(())
}

pub fn get_schedule(conn: &Connection) -> Result<Option<ScheduleRow>> {
    let row = conn
        .query_row(
            "SELECT mode, type, daily_time, interval_hours, next_run FROM schedules WHERE id = 1",
            [],
            |row| {
                Ok(ScheduleRow {
                    mode: row.get(0)?,
                    schedule_type: row.get(1)?,
                    daily_time: row.get(2)?,
                    interval_hours: row.get(3)?,
                    next_run: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn update_next_run(conn: &Connection, next_run: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE schedules SET next_run = ?1, updated_at = datetime('now') WHERE id = 1",
        [next_run],
    )?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub processos: usize,
    pub com_fonte: usize,
    pub protocolos: usize,
    pub andamentos: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let processos: usize = conn.query_row("SELECT COUNT(*) FROM processos", [], |r| r.get(0))?;
    let com_fonte: usize = conn.query_row(
        "SELECT COUNT(*) FROM processos WHERE source_url IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let protocolos: usize = conn.query_row("SELECT COUNT(*) FROM protocolos", [], |r| r.get(0))?;
    let andamentos: usize = conn.query_row("SELECT COUNT(*) FROM andamentos", [], |r| r.get(0))?;
    Ok(Stats {
        processos,
        com_fonte,
        protocolos,
        andamentos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn upsert(conn: &Connection, numero: &str, data_geracao: Option<&str>) -> Option<i64> {
        upsert_processo(
            conn,
            &ProcessoUpsert {
                numero: numero.into(),
                tipo: "Administrativo".into(),
                interessado: "UENF".into(),
                data_geracao: data_geracao.map(Into::into),
                source_url: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn upsert_is_keyed_by_numero() {
        let conn = test_conn();
        let first = upsert(&conn, "SEI-1/2025", Some("2025-03-18")).unwrap();
        let second = upsert(&conn, "SEI-1/2025", None).unwrap();
        assert_eq!(first, second);
        let count: usize = conn
            .query_row("SELECT COUNT(*) FROM processos", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn upsert_coalesces_nullable_fields() {
        let conn = test_conn();
        upsert(&conn, "SEI-1/2025", Some("2025-03-18"));
        // NULL must not clobber the stored date
        upsert(&conn, "SEI-1/2025", None);
        let row = get_processo_by_numero(&conn, "SEI-1/2025").unwrap().unwrap();
        assert_eq!(row.data_geracao.as_deref(), Some("2025-03-18"));
    }

    #[test]
    fn protocolos_conflict_skip() {
        let conn = test_conn();
        let id = upsert(&conn, "SEI-1/2025", None).unwrap();
        let rows = vec![ProtocoloInsert {
            numero: "95725517".into(),
            tipo: "Despacho".into(),
            data: Some("2025-03-19".into()),
            data_inclusao: Some("2025-03-19".into()),
            unidade: Some("UENF/DIRCCH".into()),
        }];
        assert_eq!(insert_protocolos(&conn, id, &rows).unwrap(), 1);
        assert_eq!(insert_protocolos(&conn, id, &rows).unwrap(), 0);
    }

    #[test]
    fn andamentos_dedup_covers_null_columns() {
        let conn = test_conn();
        let id = upsert(&conn, "SEI-1/2025", None).unwrap();
        let rows = vec![AndamentoInsert {
            data_hora: None,
            unidade: None,
            descricao: "Processo recebido na unidade".into(),
        }];
        assert_eq!(insert_andamentos(&conn, id, &rows).unwrap(), 1);
        assert_eq!(insert_andamentos(&conn, id, &rows).unwrap(), 0);
    }

    #[test]
    fn derived_fields_track_latest_andamento() {
        let conn = test_conn();
        let id = upsert(&conn, "SEI-1/2025", None).unwrap();
        insert_andamentos(
            &conn,
            id,
            &[
                AndamentoInsert {
                    data_hora: Some("2025-07-01T12:00:00.000Z".into()),
                    unidade: Some("UENF/DIRCCH".into()),
                    descricao: "Recebido".into(),
                },
                AndamentoInsert {
                    data_hora: Some("2025-07-02T09:30:00.000Z".into()),
                    unidade: Some("UENF/DGA".into()),
                    descricao: "Encaminhado".into(),
                },
            ],
        )
        .unwrap();
        refresh_derivados(&conn, id).unwrap();
        let row = get_processo_by_numero(&conn, "SEI-1/2025").unwrap().unwrap();
        assert_eq!(row.data_ultimo_andamento.as_deref(), Some("2025-07-02"));
        assert_eq!(row.ultima_unidade.as_deref(), Some("UENF/DGA"));
    }

    #[test]
    fn refresh_without_dated_rows_keeps_values() {
        let conn = test_conn();
        let id = upsert(&conn, "SEI-1/2025", None).unwrap();
        insert_andamentos(
            &conn,
            id,
            &[AndamentoInsert {
                data_hora: Some("2025-07-01T12:00:00.000Z".into()),
                unidade: Some("UENF/DGA".into()),
                descricao: "Recebido".into(),
            }],
        )
        .unwrap();
        refresh_derivados(&conn, id).unwrap();

        // A later refresh for a parent with no dated rows must not null out
        let other = upsert(&conn, "SEI-2/2025", None).unwrap();
        refresh_derivados(&conn, other).unwrap();
        let row = get_processo_by_numero(&conn, "SEI-1/2025").unwrap().unwrap();
        assert_eq!(row.ultima_unidade.as_deref(), Some("UENF/DGA"));
    }

    #[test]
    fn schedule_is_singleton() {
        let conn = test_conn();
        save_schedule(
            &conn,
            &ScheduleRow {
                mode: "scheduled".into(),
                schedule_type: Some("interval".into()),
                daily_time: None,
                interval_hours: Some(6),
                next_run: Some("2025-08-29T12:00:00Z".into()),
            },
        )
        .unwrap();
        save_schedule(
            &conn,
            &ScheduleRow {
                mode: "manual".into(),
                schedule_type: None,
                daily_time: None,
                interval_hours: None,
                next_run: None,
            },
        )
        .unwrap();
        let count: usize = conn
            .query_row("SELECT COUNT(*) FROM schedules", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(get_schedule(&conn).unwrap().unwrap().mode, "manual");
    }
}
