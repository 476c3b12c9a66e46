use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{Andamento, Protocolo};
use crate::normalize::{normalize_text, parse_date_br, parse_datetime_br};

static FLOW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, table").unwrap());
static TABLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());

// Section titles vary between portal revisions; ordered by how often they
// appear in captured pages.
const PROTOCOLO_TITLES: &[&str] = &[
    "Lista de Protocolos",
    "Protocolos",
    "Lista de Documentos",
    "Documentos",
];
const ANDAMENTO_TITLES: &[&str] = &[
    "Lista de Andamentos",
    "Andamentos",
    "Histórico",
    "Tramitação",
];

const PROTOCOLO_HEADER_HINTS: &[&str] = &["Processo", "Tipo", "Data"];
const ANDAMENTO_HEADER_HINTS: &[&str] = &["Data", "Unidade", "Descrição"];

pub fn extract_protocolos(doc: &Html) -> Vec<Protocolo> {
    let Some(table) = table_after_heading(doc, PROTOCOLO_TITLES)
        .or_else(|| table_with_header(doc, PROTOCOLO_HEADER_HINTS))
    else {
        return Vec::new();
    };

    let rows: Vec<ElementRef> = table.select(&ROW_SEL).collect();
    let header_idx = rows
        .iter()
        .position(|row| row.select(&CELL_SEL).next().is_some());
    let cols = header_idx.and_then(|i| ProtoCols::resolve(&cell_texts(rows[i], &CELL_SEL)));
    let data_start = match (&cols, header_idx) {
        (Some(_), Some(i)) => i + 1,
        _ => 0,
    };

    let mut out = Vec::new();
    for row in rows.iter().skip(data_start) {
        let tds = cell_texts(*row, &TD_SEL);
        if tds.len() < 5 {
            continue;
        }
        let (numero, tipo, data, inclusao, unidade) = match &cols {
            Some(c) => (
                c.numero.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.tipo.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.data.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.inclusao.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.unidade.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
            ),
            // No resolvable header: map the trailing five cells positionally,
            // which tolerates a leading selection column.
            None => {
                let s = tds.len() - 5;
                (
                    tds[s].clone(),
                    tds[s + 1].clone(),
                    tds[s + 2].clone(),
                    tds[s + 3].clone(),
                    tds[s + 4].clone(),
                )
            }
        };
        if numero.is_empty() && tipo.is_empty() {
            continue;
        }
        out.push(Protocolo {
            numero,
            tipo,
            data: parse_date_br(&data),
            data_inclusao: parse_date_br(&inclusao),
            unidade,
        });
    }
    out
}

pub fn extract_andamentos(doc: &Html) -> Vec<Andamento> {
    let Some(table) = table_after_heading(doc, ANDAMENTO_TITLES)
        .or_else(|| table_with_header(doc, ANDAMENTO_HEADER_HINTS))
    else {
        return Vec::new();
    };

    let rows: Vec<ElementRef> = table.select(&ROW_SEL).collect();
    let header_idx = rows
        .iter()
        .position(|row| row.select(&CELL_SEL).next().is_some());
    let cols = header_idx.and_then(|i| AndCols::resolve(&cell_texts(rows[i], &CELL_SEL)));
    let data_start = match (&cols, header_idx) {
        (Some(_), Some(i)) => i + 1,
        _ => 0,
    };

    let mut out = Vec::new();
    for row in rows.iter().skip(data_start) {
        let tds = cell_texts(*row, &TD_SEL);
        if tds.len() < 3 {
            continue;
        }
        let (data_hora, unidade, descricao) = match &cols {
            Some(c) => (
                c.data.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.unidade.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
                c.descricao.and_then(|i| tds.get(i)).cloned().unwrap_or_default(),
            ),
            None => (tds[0].clone(), tds[1].clone(), tds[2].clone()),
        };
        if unidade.is_empty() && descricao.is_empty() {
            continue;
        }
        out.push(Andamento {
            data_hora: parse_datetime_br(&data_hora),
            unidade,
            descricao,
        });
    }
    out
}

/// Column positions for the protocol table, resolved from header text.
struct ProtoCols {
    numero: Option<usize>,
    tipo: Option<usize>,
    data: Option<usize>,
    inclusao: Option<usize>,
    unidade: Option<usize>,
}

impl ProtoCols {
    fn resolve(header: &[String]) -> Option<Self> {
        let mut numero = None;
        let mut tipo = None;
        let mut data = None;
        let mut inclusao = None;
        let mut unidade = None;
        for (i, cell) in header.iter().enumerate() {
            // "Data de Inclusão" must win over the plain "Data" test.
            if inclusao.is_none() && cell.contains("Inclusão") {
                inclusao = Some(i);
            } else if data.is_none() && cell.contains("Data") {
                data = Some(i);
            } else if numero.is_none()
                && (cell.contains("Processo")
                    || cell.contains("Documento")
                    || cell.contains("Protocolo"))
            {
                numero = Some(i);
            } else if tipo.is_none() && cell.contains("Tipo") {
                tipo = Some(i);
            } else if unidade.is_none() && cell.contains("Unidade") {
                unidade = Some(i);
            }
        }
        (numero.is_some() && tipo.is_some()).then_some(Self {
            numero,
            tipo,
            data,
            inclusao,
            unidade,
        })
    }
}

struct AndCols {
    data: Option<usize>,
    unidade: Option<usize>,
    descricao: Option<usize>,
}

impl AndCols {
    fn resolve(header: &[String]) -> Option<Self> {
        let mut data = None;
        let mut unidade = None;
        let mut descricao = None;
        for (i, cell) in header.iter().enumerate() {
            if data.is_none() && cell.contains("Data") {
                data = Some(i);
            } else if unidade.is_none() && cell.contains("Unidade") {
                unidade = Some(i);
            } else if descricao.is_none() && cell.contains("Descrição") {
                descricao = Some(i);
            }
        }
        descricao.is_some().then_some(Self {
            data,
            unidade,
            descricao,
        })
    }
}

/// Walk headings and tables in document order; the section table is the
/// first table after a heading whose text contains one of the candidate
/// titles, tried in order.
fn table_after_heading<'a>(doc: &'a Html, titles: &[&str]) -> Option<ElementRef<'a>> {
    for title in titles {
        let mut heading_seen = false;
        for el in doc.select(&FLOW_SEL) {
            if el.value().name() == "table" {
                if heading_seen {
                    return Some(el);
                }
            } else if !heading_seen {
                let text = normalize_text(&el.text().collect::<String>());
                if text.contains(title) {
                    heading_seen = true;
                }
            }
        }
    }
    None
}

/// Fallback when no known heading matched: the first table whose first row
/// mentions every hint.
fn table_with_header<'a>(doc: &'a Html, hints: &[&str]) -> Option<ElementRef<'a>> {
    doc.select(&TABLE_SEL).find(|table| {
        let Some(first_row) = table.select(&ROW_SEL).next() else {
            return false;
        };
        let joined = cell_texts(first_row, &CELL_SEL).join(" ");
        hints.iter().all(|hint| joined.contains(hint))
    })
}

fn cell_texts(row: ElementRef, selector: &Selector) -> Vec<String> {
    row.select(selector)
        .map(|cell| normalize_text(&cell.text().collect::<String>()))
        .collect()
}
