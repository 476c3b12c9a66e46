use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::Autuacao;
use crate::normalize::{normalize_text, parse_date_br};

static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

// Label variants observed across portal page revisions, most common first.
const NUMERO_LABELS: &[&str] = &["Processo:", "Número:"];
const TIPO_LABELS: &[&str] = &["Tipo:", "Tipo do Processo:"];
const DATA_GERACAO_LABELS: &[&str] = &["Data de Geração:", "Data de Autuação:"];
const INTERESSADO_LABELS: &[&str] = &["Interessados:", "Interessado:"];

const RESTRICTED_PHRASE: &str = "processo ou documento de acesso restrito";

pub fn extract(doc: &Html) -> Autuacao {
    let rows = cell_rows(doc);

    let numero = field_from_cells(&rows, NUMERO_LABELS);
    let tipo = field_from_cells(&rows, TIPO_LABELS);
    let data_geracao = parse_date_br(&field_from_cells(&rows, DATA_GERACAO_LABELS));
    let interessado = field_from_cells(&rows, INTERESSADO_LABELS);

    let body_text = doc
        .select(&BODY_SEL)
        .next()
        .map(|body| body.text().collect::<String>())
        .unwrap_or_default();
    let acesso_restrito = body_text.to_lowercase().contains(RESTRICTED_PHRASE);

    Autuacao {
        numero,
        tipo,
        data_geracao,
        interessado,
        acesso_restrito,
    }
}

/// All table rows as normalized cell texts.
fn cell_rows(doc: &Html) -> Vec<Vec<String>> {
    doc.select(&ROW_SEL)
        .map(|row| {
            row.select(&CELL_SEL)
                .map(|cell| normalized_cell_text(cell))
                .collect()
        })
        .collect()
}

fn normalized_cell_text(cell: ElementRef) -> String {
    normalize_text(&cell.text().collect::<String>())
}

/// Try candidate labels in order; the first one that yields a non-empty
/// value wins. On a label match the value is the adjacent cell, falling
/// back to the row's second cell, falling back to the row's last cell when
/// it is not the label cell itself.
fn field_from_cells(rows: &[Vec<String>], labels: &[&str]) -> String {
    for label in labels {
        for row in rows {
            let Some(idx) = row.iter().position(|cell| cell == label) else {
                continue;
            };
            if let Some(next) = row.get(idx + 1) {
                if !next.is_empty() {
                    return next.clone();
                }
            }
            if idx != 1 {
                if let Some(second) = row.get(1) {
                    if !second.is_empty() {
                        return second.clone();
                    }
                }
            }
            if let Some(last) = row.last() {
                if idx != row.len() - 1 && !last.is_empty() {
                    return last.clone();
                }
            }
        }
    }
    String::new()
}
