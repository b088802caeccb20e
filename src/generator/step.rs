use std::convert::Infallible;
use std::ops::Range;

use super::batch::run_batches;
use super::dispatch::Dispatch;
use super::policy::ParameterPassthrough;
use crate::expression::evaluate;
use crate::grammar::{JaggedIndex, Symbol, SymbolString};
use crate::rules::{BranchCache, InvariantViolation, MatchScratch, RuleTable};

// Marks a position no rule matched
const NO_RULE: u32 = u32::MAX;

/// What happens to one symbol of the input string.
#[derive(Debug, Clone, Copy)]
struct MatchRecord {
    rule: u32,
    outcome: u16,
    // Slice of the capture buffer reserved for this position
    captured: JaggedIndex,
    symbol_count: u32,
    parameter_count: u32,
    symbol_offset: u32,
    parameter_offset: u32,
}

impl MatchRecord {
    fn is_trivial(&self) -> bool {
        self.rule == NO_RULE
    }
}

pub(super) struct StepInput<'a> {
    pub table: &'a RuleTable,
    pub string: &'a SymbolString,
    pub globals: &'a [f32],
    pub seed: u64,
    pub passthrough: &'a dyn ParameterPassthrough,
    pub batch_size: usize,
    pub parallel: bool,
}

// Position ranges of `len` split into batches
fn batches(len: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len).step_by(batch_size).map(move |start| start..(start + batch_size).min(len))
}

/// Rewrites every symbol of the input in parallel: match, then size, then
/// write. The output only depends on the input string, the globals and the
/// seed.
pub(super) fn evaluate_step(input: &StepInput) -> Result<SymbolString, InvariantViolation> {
    let mut records = reserve_captures(input.table, input.string);
    let capture_total = records.last().map_or(0, |record| record.captured.range().end);
    let mut captures = vec![0.0f32; capture_total];

    match_phase(input, &mut records, &mut captures);
    let (symbol_total, parameter_total) = size_phase(input, &mut records);
    write_phase(input, &records, &captures, symbol_total, parameter_total)
}

fn reserve_captures(table: &RuleTable, string: &SymbolString) -> Vec<MatchRecord> {
    let mut offset = 0usize;
    string
        .symbols()
        .iter()
        .map(|&symbol| {
            let capacity = table.rules_for(symbol).map_or(0, |rules| rules.capture_capacity as usize);
            let captured = JaggedIndex::new(offset, capacity);
            offset += capacity;
            MatchRecord {
                rule: NO_RULE,
                outcome: 0,
                captured,
                symbol_count: 0,
                parameter_count: 0,
                symbol_offset: 0,
                parameter_offset: 0,
            }
        })
        .collect()
}

fn match_phase(input: &StepInput, mut records: &mut [MatchRecord], mut captures: &mut [f32]) {
    let branches = BranchCache::new(input.string.symbols());
    let dispatch = Dispatch {
        table: input.table,
        string: input.string,
        branches: &branches,
        globals: input.globals,
        seed: input.seed,
    };

    let mut units = Vec::new();
    for batch in batches(records.len(), input.batch_size) {
        let (batch_records, rest) = std::mem::take(&mut records).split_at_mut(batch.len());
        records = rest;
        let capture_base = batch_records[0].captured.range().start;
        let capture_end = batch_records[batch.len() - 1].captured.range().end;
        let (batch_captures, rest) = std::mem::take(&mut captures).split_at_mut(capture_end - capture_base);
        captures = rest;
        units.push((batch.start, batch_records, batch_captures, capture_base));
    }

    run_batches(
        units,
        input.parallel,
        MatchScratch::new,
        |scratch, (start, records, captures, capture_base)| {
            for (offset, record) in records.iter_mut().enumerate() {
                let range = record.captured.range();
                let captured = &mut captures[range.start - capture_base..range.end - capture_base];
                if let Some((rule, outcome)) = dispatch.select(start + offset, captured, scratch) {
                    record.rule = rule;
                    record.outcome = outcome;
                }
            }
            Ok::<(), Infallible>(())
        },
    )
    .unwrap_or_else(|never| match never {});
}

// Sequential prefix sum over the output sizes of every position
fn size_phase(input: &StepInput, records: &mut [MatchRecord]) -> (usize, usize) {
    let (mut symbols, mut parameters) = (0usize, 0usize);
    for (index, record) in records.iter_mut().enumerate() {
        if record.is_trivial() {
            let symbol = input.string.symbol(index);
            record.symbol_count = 1;
            record.parameter_count = if input.passthrough.keeps_parameters(symbol) {
                input.string.parameter_count(index) as u32
            } else {
                0
            };
        } else {
            let rule = &input.table.rules[record.rule as usize];
            let outcome = input.table.outcome(rule, record.outcome as usize);
            record.symbol_count = outcome.replacements.len() as u32;
            record.parameter_count = outcome.parameter_count;
        }
        record.symbol_offset = symbols as u32;
        record.parameter_offset = parameters as u32;
        symbols += record.symbol_count as usize;
        parameters += record.parameter_count as usize;
    }
    (symbols, parameters)
}

struct WriteUnit<'a> {
    start: usize,
    records: &'a [MatchRecord],
    symbols: &'a mut [Symbol],
    indexing: &'a mut [JaggedIndex],
    parameters: &'a mut [f32],
    symbol_base: usize,
    parameter_base: usize,
}

fn write_phase(
    input: &StepInput,
    records: &[MatchRecord],
    captures: &[f32],
    symbol_total: usize,
    parameter_total: usize,
) -> Result<SymbolString, InvariantViolation> {
    let mut symbols = vec![Symbol(0); symbol_total];
    let mut indexing = vec![JaggedIndex::default(); symbol_total];
    let mut parameters = vec![0.0f32; parameter_total];

    {
        let mut units = Vec::new();
        let (mut symbols_rest, mut indexing_rest, mut parameters_rest) =
            (symbols.as_mut_slice(), indexing.as_mut_slice(), parameters.as_mut_slice());
        for batch in batches(records.len(), input.batch_size) {
            let batch_records = &records[batch.clone()];
            let first = batch_records[0];
            let last = batch_records[batch_records.len() - 1];
            let symbol_len = (last.symbol_offset + last.symbol_count - first.symbol_offset) as usize;
            let parameter_len = (last.parameter_offset + last.parameter_count - first.parameter_offset) as usize;

            let (batch_symbols, rest) = std::mem::take(&mut symbols_rest).split_at_mut(symbol_len);
            symbols_rest = rest;
            let (batch_indexing, rest) = std::mem::take(&mut indexing_rest).split_at_mut(symbol_len);
            indexing_rest = rest;
            let (batch_parameters, rest) = std::mem::take(&mut parameters_rest).split_at_mut(parameter_len);
            parameters_rest = rest;

            units.push(WriteUnit {
                start: batch.start,
                records: batch_records,
                symbols: batch_symbols,
                indexing: batch_indexing,
                parameters: batch_parameters,
                symbol_base: first.symbol_offset as usize,
                parameter_base: first.parameter_offset as usize,
            });
        }

        run_batches(units, input.parallel, || (), |_, unit| write_batch(input, captures, unit))?;
    }

    Ok(SymbolString::from_parts(symbols, indexing, parameters))
}

fn write_batch(input: &StepInput, captures: &[f32], unit: WriteUnit) -> Result<(), InvariantViolation> {
    for (offset, record) in unit.records.iter().enumerate() {
        let index = unit.start + offset;
        let mut symbol_at = record.symbol_offset as usize - unit.symbol_base;
        let mut parameter_at = record.parameter_offset as usize;

        if record.is_trivial() {
            let count = record.parameter_count as usize;
            unit.symbols[symbol_at] = input.string.symbol(index);
            unit.indexing[symbol_at] = JaggedIndex::new(parameter_at, count);
            let local = parameter_at - unit.parameter_base;
            unit.parameters[local..local + count].copy_from_slice(&input.string.parameters(index)[..count]);
            continue;
        }

        let rule = input.table.rules.get(record.rule as usize).ok_or(InvariantViolation::TrivialSymbolNotIndicated {
            symbol: input.string.symbol(index),
            index,
        })?;
        let outcome = input.table.outcome(rule, record.outcome as usize);
        let locals = &captures[record.captured.range()];
        for replacement in &input.table.replacements[outcome.replacements.range()] {
            let expressions = &input.table.expressions[replacement.parameters.range()];
            unit.symbols[symbol_at] = replacement.symbol;
            unit.indexing[symbol_at] = JaggedIndex::new(parameter_at, expressions.len());
            for &expression in expressions {
                unit.parameters[parameter_at - unit.parameter_base] = evaluate(input.table.ops(expression), input.globals, locals);
                parameter_at += 1;
            }
            symbol_at += 1;
        }
    }
    Ok(())
}
