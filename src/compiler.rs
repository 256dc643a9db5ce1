//! Compiler: Source → Bytecode
//!
//! A single pass: the grammar drives the [`Parser`] cursor and emits
//! instructions straight into a [`Chunk`]. No syntax tree is built. Every
//! expression is typed while it is compiled, and the compiler tracks how many
//! value-stack bytes the current function has live so that locals can be
//! addressed by their offset from the frame base.

use crate::bytecode::{BinaryOp, Chunk, Constant, Function, FunctionType, Instruction, Primitive};
use crate::error::CompileError;
use crate::lexer::{tokenize, unescape_string, ScannerSet};
use crate::parser::{declaration_boundary, statement_boundary, Parser};
use crate::token::{Slice, Token, TokenKind};
use crate::value::{ValueType, BOOL_SIZE, FLOAT_SIZE, INT_SIZE, STRING_SIZE};
use tracing::{debug, trace};

/// Whether debug metadata (shadow locals) is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Debug,
    Release,
}

/// Compile-time knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Stop recording diagnostics after this many (0 = unlimited).
    pub max_errors: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { max_errors: 64 }
    }
}

/// Name and source uri of the function built by `compile_expression`.
pub const EXPRESSION_ENTRY: &str = "<expression>";

/// Deepest nesting of parentheses, blocks and prefix operators accepted in
/// one expression.
pub const MAX_NESTING: usize = 256;

/// Local variable in scope
#[derive(Debug, Clone)]
struct Local {
    name: String,
    ty: ValueType,
    /// Byte offset from the frame base.
    offset: usize,
    depth: usize,
    mutable: bool,
}

/// Function being compiled
#[derive(Debug)]
struct FunctionCompiler {
    locals: Vec<Local>,
    scope_depth: usize,
    /// Live value-stack bytes above the frame base.
    stack_size: usize,
    /// `None` while compiling a bare expression.
    return_type: Option<ValueType>,
}

impl FunctionCompiler {
    fn new(return_type: Option<ValueType>) -> Self {
        Self {
            locals: Vec::new(),
            scope_depth: 0,
            stack_size: 0,
            return_type,
        }
    }

    fn resolve(&self, name: &str) -> Option<&Local> {
        self.locals.iter().rev().find(|local| local.name == name)
    }
}

/// The bytecode compiler
pub struct Compiler<'a> {
    scanners: &'a ScannerSet,
    options: CompileOptions,
}

impl<'a> Compiler<'a> {
    pub fn new(scanners: &'a ScannerSet, options: CompileOptions) -> Self {
        Self { scanners, options }
    }

    /// Compile `(uri, text)` sources into `chunk`. Every top-level function
    /// header is declared before any body is compiled, so calls may refer to
    /// functions declared later or in another source.
    pub fn compile(&self, chunk: &mut Chunk, sources: &[(&str, &str)]) -> Vec<CompileError> {
        let offsets: Vec<usize> = sources
            .iter()
            .map(|(uri, text)| chunk.add_source(uri, text))
            .collect();

        for ((_, text), offset) in sources.iter().zip(&offsets) {
            declare_functions(chunk, self.scanners, text, *offset);
        }

        let mut errors = Vec::new();
        for ((uri, text), offset) in sources.iter().zip(&offsets) {
            let Some(budget) = self.budget(&errors) else {
                break;
            };
            let parser = Parser::new(text, self.scanners, *offset, budget);
            let mut grammar = Grammar::new(chunk, parser);
            grammar.program();
            let found = grammar.finish();
            debug!(target: "rill::compiler", uri = %uri, errors = found.len(), "compiled source");
            errors.extend(found);
        }
        errors
    }

    /// Compile a single expression into an entry function named
    /// [`EXPRESSION_ENTRY`] that returns its value.
    pub fn compile_expression(&self, chunk: &mut Chunk, text: &str) -> Vec<CompileError> {
        let offset = chunk.add_source(EXPRESSION_ENTRY, text);
        let parser = Parser::new(text, self.scanners, offset, self.options.max_errors);
        let mut grammar = Grammar::new(chunk, parser);
        grammar.entry_expression();
        let errors = grammar.finish();
        debug!(target: "rill::compiler", errors = errors.len(), "compiled expression");
        errors
    }

    /// Remaining diagnostic budget for the next source; `None` once spent.
    fn budget(&self, errors: &[CompileError]) -> Option<usize> {
        match self.options.max_errors {
            0 => Some(0),
            max if errors.len() < max => Some(max - errors.len()),
            _ => None,
        }
    }
}

/// A function header read by the declaration pre-pass.
struct Header {
    name: String,
    name_slice: Slice,
    parameters: Vec<(String, ValueType)>,
    return_type: ValueType,
}

/// Declare every well-formed top-level function header in `text`. Malformed
/// headers are skipped here and reported by the main pass.
fn declare_functions(chunk: &mut Chunk, scanners: &ScannerSet, text: &str, offset: usize) {
    let stream = tokenize(text, scanners);
    let tokens = &stream.tokens;
    let mut depth = 0usize;
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::LeftBrace => depth += 1,
            TokenKind::RightBrace => depth = depth.saturating_sub(1),
            TokenKind::Fn if depth == 0 => {
                if let Some((header, next)) = read_header(chunk, text, tokens, i + 1) {
                    let taken = chunk.functions.iter().any(|f| f.name == header.name)
                        || chunk.natives.iter().any(|n| n.name == header.name);
                    if !taken {
                        let (names, types): (Vec<String>, Vec<ValueType>) = header.parameters.into_iter().unzip();
                        let type_index = chunk.add_function_type(FunctionType::new(types, header.return_type));
                        trace!(target: "rill::compiler", name = %header.name, "declared function");
                        chunk.functions.push(Function {
                            name: header.name,
                            type_index,
                            entry: 0,
                            parameter_names: names,
                            slice: header.name_slice.shifted(offset),
                        });
                    }
                    i = next;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

/// Read `IDENT '(' params ')' ('->' type)?` starting at `at`. Unknown type
/// names resolve to `Never`.
fn read_header(chunk: &Chunk, text: &str, tokens: &[Token], at: usize) -> Option<(Header, usize)> {
    let kind = |i: usize| tokens.get(i).map(|t| t.kind);
    let resolve = |token: &Token| chunk.types.resolve(token.text(text)).unwrap_or(ValueType::Never);

    let mut i = at;
    if kind(i)? != TokenKind::Ident || kind(i + 1)? != TokenKind::LeftParen {
        return None;
    }
    let name_token = tokens[i];
    i += 2;

    let mut parameters = Vec::new();
    if kind(i)? != TokenKind::RightParen {
        loop {
            if kind(i)? != TokenKind::Ident || kind(i + 1)? != TokenKind::Colon || kind(i + 2)? != TokenKind::Ident {
                return None;
            }
            parameters.push((tokens[i].text(text).to_string(), resolve(&tokens[i + 2])));
            i += 3;
            match kind(i)? {
                TokenKind::Comma => i += 1,
                TokenKind::RightParen => break,
                _ => return None,
            }
        }
    }
    i += 1;

    let mut return_type = ValueType::Unit;
    if kind(i)? == TokenKind::Arrow {
        if kind(i + 1)? != TokenKind::Ident {
            return None;
        }
        return_type = resolve(&tokens[i + 1]);
        i += 2;
    }

    let header = Header {
        name: name_token.text(text).to_string(),
        name_slice: name_token.slice(),
        parameters,
        return_type,
    };
    Some((header, i))
}

/// Grammar and code generation over one source.
struct Grammar<'a, 'c> {
    parser: Parser<'a>,
    chunk: &'c mut Chunk,
    function: FunctionCompiler,
    /// Current expression nesting, bounded by [`MAX_NESTING`].
    depth: usize,
}

impl<'a, 'c> Grammar<'a, 'c> {
    fn new(chunk: &'c mut Chunk, parser: Parser<'a>) -> Self {
        Self {
            parser,
            chunk,
            function: FunctionCompiler::new(None),
            depth: 0,
        }
    }

    fn finish(self) -> Vec<CompileError> {
        self.parser.into_errors()
    }

    fn debug_mode(&self) -> bool {
        self.chunk.mode == Mode::Debug
    }

    fn type_name(&self, ty: ValueType) -> String {
        self.chunk.types.type_name(ty)
    }

    // ==================== Emission ====================

    /// Write an instruction and track its effect on the live stack size.
    fn emit(&mut self, instruction: Instruction, slice: Slice) -> usize {
        let (popped, pushed) = self.stack_effect(&instruction);
        self.function.stack_size = self.function.stack_size.saturating_sub(popped) + pushed;
        self.chunk.write(instruction, slice)
    }

    fn stack_effect(&self, instruction: &Instruction) -> (usize, usize) {
        let call_effect = |type_index: Option<usize>| {
            type_index
                .and_then(|i| self.chunk.function_types.get(i))
                .map_or((0, 0), |t| (t.parameter_size, t.return_type.size()))
        };
        match *instruction {
            Instruction::Constant(index) => match self.chunk.constants.get(index) {
                Some(Constant::Int(_)) => (0, INT_SIZE),
                Some(Constant::Float(_)) => (0, FLOAT_SIZE),
                Some(Constant::String(_)) => (0, STRING_SIZE),
                None => (0, 0),
            },
            Instruction::True | Instruction::False => (0, BOOL_SIZE),
            Instruction::Pop(size) => (size, 0),
            Instruction::Squash { drop, .. } => (drop, 0),
            Instruction::LoadLocal { size, .. } => (0, size),
            Instruction::StoreLocal { size, .. } => (size, 0),
            Instruction::Binary(op, primitive) => {
                let operand = primitive.value_type().size();
                let result = if op.is_comparison() { BOOL_SIZE } else { operand };
                (operand * 2, result)
            }
            Instruction::Negate(_) | Instruction::Not | Instruction::Jump(_) => (0, 0),
            Instruction::JumpIfFalse(_) | Instruction::JumpIfTrue(_) => (BOOL_SIZE, 0),
            Instruction::Call(index) => call_effect(self.chunk.functions.get(index).map(|f| f.type_index)),
            Instruction::CallNative(index) => call_effect(self.chunk.natives.get(index).map(|n| n.type_index)),
            Instruction::Return(size) => (size, 0),
            Instruction::MakeStruct(_) => (0, 0),
            Instruction::Field { ty, struct_size, .. } => (struct_size, ty.size()),
            Instruction::DebugPushLocal { .. } | Instruction::DebugPopLocals(_) => (0, 0),
        }
    }

    fn patch(&mut self, address: usize) {
        let target = self.chunk.len();
        self.chunk.patch_jump(address, target);
    }

    fn emit_constant(&mut self, constant: Constant, slice: Slice) {
        let index = self.chunk.add_constant(constant);
        self.emit(Instruction::Constant(index), slice);
    }

    // ==================== Scopes ====================

    fn begin_scope(&mut self) {
        self.function.scope_depth += 1;
    }

    /// Drop the scope's locals from beneath a `result` value.
    fn end_scope(&mut self, result: ValueType, slice: Slice) {
        self.function.scope_depth = self.function.scope_depth.saturating_sub(1);
        let depth = self.function.scope_depth;
        let Some(first) = self.function.locals.iter().position(|l| l.depth > depth) else {
            return;
        };
        let removed = self.function.locals.split_off(first);
        let drop: usize = removed.iter().map(|l| l.ty.size()).sum();
        if drop > 0 {
            self.emit(
                Instruction::Squash {
                    keep: result.size(),
                    drop,
                },
                slice,
            );
        }
        if self.debug_mode() {
            self.emit(Instruction::DebugPopLocals(removed.len()), slice);
        }
    }

    fn add_local(&mut self, token: Token, ty: ValueType, offset: usize, mutable: bool) {
        let name = self.parser.text(&token).to_string();
        if self.debug_mode() {
            let name_index = self.chunk.add_name(&name);
            self.emit(
                Instruction::DebugPushLocal {
                    name: name_index,
                    ty,
                    offset,
                },
                token.slice(),
            );
        }
        self.function.locals.push(Local {
            name,
            ty,
            offset,
            depth: self.function.scope_depth,
            mutable,
        });
    }

    // ==================== Types ====================

    fn parse_type(&mut self) -> ValueType {
        if !self.parser.consume(TokenKind::Ident, "expected type name") {
            return ValueType::Never;
        }
        let token = self.parser.previous;
        let name = self.parser.text(&token);
        match self.chunk.types.resolve(name) {
            Some(ty) => ty,
            None => {
                self.parser.error_at(token.slice(), format!("unknown type '{}'", name));
                ValueType::Never
            }
        }
    }

    fn expect_bool(&mut self, ty: ValueType, slice: Slice, what: &str) {
        if ty != ValueType::Bool && ty != ValueType::Never {
            let message = format!("{} must be bool, found {}", what, self.type_name(ty));
            self.parser.error_at(slice, message);
        }
    }

    // ==================== Declarations ====================

    fn program(&mut self) {
        while !self.parser.check(TokenKind::End) {
            if self.parser.match_kind(TokenKind::Fn) {
                self.function_declaration();
            } else {
                self.parser.error_at_current("expected function declaration");
                self.parser.advance();
            }
            if self.parser.panic_mode() {
                self.parser.synchronize(declaration_boundary);
            }
        }
    }

    fn function_declaration(&mut self) {
        if !self.parser.consume(TokenKind::Ident, "expected function name") {
            return;
        }
        let name_token = self.parser.previous;
        let name = self.parser.text(&name_token).to_string();
        if !self.parser.consume(TokenKind::LeftParen, "expected '(' after function name") {
            return;
        }

        let mut parameters: Vec<(Token, ValueType)> = Vec::new();
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                if !self.parser.consume(TokenKind::Ident, "expected parameter name") {
                    return;
                }
                let param = self.parser.previous;
                if !self.parser.consume(TokenKind::Colon, "expected ':' after parameter name") {
                    return;
                }
                let ty = self.parse_type();
                let param_name = self.parser.text(&param);
                if parameters.iter().any(|(p, _)| self.parser.text(p) == param_name) {
                    self.parser
                        .error_at(param.slice(), format!("duplicate parameter '{}'", param_name));
                }
                parameters.push((param, ty));
                if !self.parser.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        if !self.parser.consume(TokenKind::RightParen, "expected ')' after parameters") {
            return;
        }
        let return_type = if self.parser.match_kind(TokenKind::Arrow) {
            self.parse_type()
        } else {
            ValueType::Unit
        };
        if !self.parser.consume(TokenKind::LeftBrace, "expected '{' before function body") {
            return;
        }

        let function_type = FunctionType::new(parameters.iter().map(|(_, ty)| *ty).collect(), return_type);
        let type_index = self.chunk.add_function_type(function_type);
        let entry = self.chunk.len();
        let declared = self
            .chunk
            .functions
            .iter()
            .position(|f| f.slice == name_token.slice());
        match declared {
            Some(index) => {
                let function = &mut self.chunk.functions[index];
                function.entry = entry;
                function.type_index = type_index;
            }
            None => {
                let taken = self.chunk.functions.iter().any(|f| f.name == name)
                    || self.chunk.natives.iter().any(|n| n.name == name);
                if taken {
                    self.parser
                        .error_at(name_token.slice(), format!("function '{}' is already defined", name));
                    return;
                }
                self.chunk.functions.push(Function {
                    name: name.clone(),
                    type_index,
                    entry,
                    parameter_names: parameters.iter().map(|(p, _)| self.parser.text(p).to_string()).collect(),
                    slice: name_token.slice(),
                });
            }
        }

        self.function = FunctionCompiler::new(Some(return_type));
        let mut offset = 0;
        for (param, ty) in &parameters {
            self.add_local(*param, *ty, offset, false);
            offset += ty.size();
        }
        self.function.stack_size = offset;

        let body = self.block();
        if body != ValueType::Never && body != return_type {
            let message = format!(
                "function '{}' returns {}, but its body evaluates to {}",
                name,
                self.type_name(return_type),
                self.type_name(body)
            );
            self.parser.error_at_previous(message);
        }
        let closing = self.parser.previous.slice();
        self.emit(Instruction::Return(return_type.size()), closing);
        trace!(target: "rill::compiler", name = %name, entry, "compiled function");
    }

    /// Compile a lone expression as the body of the entry function.
    fn entry_expression(&mut self) {
        let entry = self.chunk.len();
        let start = self.parser.current.slice();
        self.function = FunctionCompiler::new(None);

        let mut ty = self.expression();
        if !self.parser.check(TokenKind::End) {
            self.parser.error_at_current("expected end of expression");
        }
        if ty == ValueType::Never {
            ty = ValueType::Unit;
        }

        let type_index = self.chunk.add_function_type(FunctionType::new(Vec::new(), ty));
        self.chunk.functions.push(Function {
            name: EXPRESSION_ENTRY.to_string(),
            type_index,
            entry,
            parameter_names: Vec::new(),
            slice: start,
        });
        let end = self.parser.previous.slice();
        self.emit(Instruction::Return(ty.size()), end);
    }

    // ==================== Statements ====================

    /// Compile a block whose `{` was just consumed; yields its last
    /// statement's type.
    fn block(&mut self) -> ValueType {
        self.begin_scope();
        let mut last = ValueType::Unit;
        while !self.parser.check(TokenKind::RightBrace) && !self.parser.check(TokenKind::End) {
            if last.size() > 0 {
                let slice = self.parser.previous.slice();
                self.emit(Instruction::Pop(last.size()), slice);
            }
            last = self.statement();
            if self.parser.panic_mode() {
                self.parser.synchronize(statement_boundary);
                last = ValueType::Never;
            }
        }
        self.parser.consume(TokenKind::RightBrace, "expected '}' after block");
        let closing = self.parser.previous.slice();
        self.end_scope(last, closing);
        last
    }

    fn statement(&mut self) -> ValueType {
        if self.parser.match_kind(TokenKind::Let) {
            self.binding(false)
        } else if self.parser.match_kind(TokenKind::Mut) {
            self.binding(true)
        } else {
            self.expression()
        }
    }

    fn binding(&mut self, mutable: bool) -> ValueType {
        if !self.parser.consume(TokenKind::Ident, "expected variable name") {
            return ValueType::Never;
        }
        let name = self.parser.previous;
        if !self.parser.consume(TokenKind::Equal, "expected '=' after variable name") {
            return ValueType::Never;
        }
        let ty = self.expression();
        let offset = self.function.stack_size.saturating_sub(ty.size());
        self.add_local(name, ty, offset, mutable);
        ValueType::Unit
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> ValueType {
        let ty = self.or(true);
        if self.parser.check(TokenKind::Equal) {
            self.parser.error_at_current("invalid assignment target");
        }
        ty
    }

    fn or(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.and(can_assign);
        while self.parser.match_kind(TokenKind::Or) {
            let operator = self.parser.previous.slice();
            self.expect_bool(left, operator, "left operand of 'or'");
            let short = self.emit(Instruction::JumpIfTrue(0), operator);
            let base = self.function.stack_size;
            let right = self.and(false);
            self.expect_bool(right, operator, "right operand of 'or'");
            let end = self.emit(Instruction::Jump(0), operator);
            self.patch(short);
            self.function.stack_size = base;
            self.emit(Instruction::True, operator);
            self.patch(end);
            left = ValueType::Bool;
        }
        left
    }

    fn and(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.equality(can_assign);
        while self.parser.match_kind(TokenKind::And) {
            let operator = self.parser.previous.slice();
            self.expect_bool(left, operator, "left operand of 'and'");
            let short = self.emit(Instruction::JumpIfFalse(0), operator);
            let base = self.function.stack_size;
            let right = self.equality(false);
            self.expect_bool(right, operator, "right operand of 'and'");
            let end = self.emit(Instruction::Jump(0), operator);
            self.patch(short);
            self.function.stack_size = base;
            self.emit(Instruction::False, operator);
            self.patch(end);
            left = ValueType::Bool;
        }
        left
    }

    fn equality(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.comparison(can_assign);
        loop {
            let op = match self.parser.current.kind {
                TokenKind::EqualEqual => BinaryOp::Equal,
                TokenKind::BangEqual => BinaryOp::NotEqual,
                _ => break,
            };
            self.parser.advance();
            let operator = self.parser.previous;
            let right = self.comparison(false);
            left = self.binary(op, operator, left, right);
        }
        left
    }

    fn comparison(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.term(can_assign);
        loop {
            let op = match self.parser.current.kind {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.parser.advance();
            let operator = self.parser.previous;
            let right = self.term(false);
            left = self.binary(op, operator, left, right);
        }
        left
    }

    fn term(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.factor(can_assign);
        loop {
            let op = match self.parser.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.parser.advance();
            let operator = self.parser.previous;
            let right = self.factor(false);
            left = self.binary(op, operator, left, right);
        }
        left
    }

    fn factor(&mut self, can_assign: bool) -> ValueType {
        let mut left = self.unary(can_assign);
        loop {
            let op = match self.parser.current.kind {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Remainder,
                _ => break,
            };
            self.parser.advance();
            let operator = self.parser.previous;
            let right = self.unary(false);
            left = self.binary(op, operator, left, right);
        }
        left
    }

    /// Type-check and emit a binary operator.
    fn binary(&mut self, op: BinaryOp, operator: Token, left: ValueType, right: ValueType) -> ValueType {
        if left == ValueType::Never || right == ValueType::Never {
            return ValueType::Never;
        }
        let allowed = left == right
            && match op {
                BinaryOp::Add => matches!(left, ValueType::Int | ValueType::Float | ValueType::String),
                BinaryOp::Equal | BinaryOp::NotEqual => Primitive::of(left).is_some(),
                _ => left.is_numeric(),
            };
        let primitive = Primitive::of(left).filter(|_| allowed);
        let Some(primitive) = primitive else {
            let message = format!(
                "operator '{}' cannot be applied to {} and {}",
                self.parser.text(&operator),
                self.type_name(left),
                self.type_name(right)
            );
            self.parser.error_at(operator.slice(), message);
            return ValueType::Never;
        };
        self.emit(Instruction::Binary(op, primitive), operator.slice());
        if op.is_comparison() {
            ValueType::Bool
        } else {
            left
        }
    }

    fn unary(&mut self, can_assign: bool) -> ValueType {
        if self.depth >= MAX_NESTING {
            self.parser.error_at_current("expression nested too deeply");
            // Consume a token so recovery always makes progress.
            if !self.parser.check(TokenKind::End) {
                self.parser.advance();
            }
            return ValueType::Never;
        }
        self.depth += 1;
        let ty = self.prefix(can_assign);
        self.depth -= 1;
        ty
    }

    fn prefix(&mut self, can_assign: bool) -> ValueType {
        if !matches!(self.parser.current.kind, TokenKind::Minus | TokenKind::Bang) {
            return self.postfix(can_assign);
        }
        self.parser.advance();
        let operator = self.parser.previous;
        let operand = self.unary(false);
        if operand == ValueType::Never {
            return ValueType::Never;
        }
        let instruction = match (operator.kind, Primitive::of(operand)) {
            (TokenKind::Minus, Some(primitive @ (Primitive::Int | Primitive::Float))) => {
                Some(Instruction::Negate(primitive))
            }
            (TokenKind::Bang, Some(Primitive::Bool)) => Some(Instruction::Not),
            _ => None,
        };
        match instruction {
            Some(instruction) => {
                self.emit(instruction, operator.slice());
                operand
            }
            None => {
                let message = format!(
                    "operator '{}' cannot be applied to {}",
                    self.parser.text(&operator),
                    self.type_name(operand)
                );
                self.parser.error_at(operator.slice(), message);
                ValueType::Never
            }
        }
    }

    fn postfix(&mut self, can_assign: bool) -> ValueType {
        let mut ty = self.primary(can_assign);
        while self.parser.match_kind(TokenKind::Dot) {
            if !self.parser.consume(TokenKind::Ident, "expected field name after '.'") {
                return ValueType::Never;
            }
            let field_token = self.parser.previous;
            if ty == ValueType::Never {
                continue;
            }
            let field_name = self.parser.text(&field_token);
            let Some(field) = self.chunk.types.get(ty).and_then(|def| def.field(field_name)).cloned() else {
                let message = format!("type '{}' has no field '{}'", self.type_name(ty), field_name);
                self.parser.error_at(field_token.slice(), message);
                ty = ValueType::Never;
                continue;
            };
            self.emit(
                Instruction::Field {
                    offset: field.offset,
                    ty: field.ty,
                    struct_size: ty.size(),
                },
                field_token.slice(),
            );
            ty = field.ty;
        }
        ty
    }

    fn primary(&mut self, can_assign: bool) -> ValueType {
        let token = self.parser.current;
        match token.kind {
            TokenKind::Int => {
                self.parser.advance();
                match self.parser.text(&token).parse::<i64>() {
                    Ok(value) => {
                        self.emit_constant(Constant::Int(value), token.slice());
                        ValueType::Int
                    }
                    Err(_) => {
                        self.parser.error_at(token.slice(), "integer literal out of range");
                        ValueType::Never
                    }
                }
            }
            TokenKind::Float => {
                self.parser.advance();
                match self.parser.text(&token).parse::<f64>() {
                    Ok(value) => {
                        self.emit_constant(Constant::Float(value), token.slice());
                        ValueType::Float
                    }
                    Err(_) => {
                        self.parser.error_at(token.slice(), "invalid float literal");
                        ValueType::Never
                    }
                }
            }
            TokenKind::String => {
                self.parser.advance();
                let value = unescape_string(self.parser.text(&token));
                let index = self.chunk.add_string(&value);
                self.emit(Instruction::Constant(index), token.slice());
                ValueType::String
            }
            TokenKind::True => {
                self.parser.advance();
                self.emit(Instruction::True, token.slice());
                ValueType::Bool
            }
            TokenKind::False => {
                self.parser.advance();
                self.emit(Instruction::False, token.slice());
                ValueType::Bool
            }
            TokenKind::LeftParen => {
                self.parser.advance();
                let ty = self.expression();
                self.parser.consume(TokenKind::RightParen, "expected ')' after expression");
                ty
            }
            TokenKind::LeftBrace => {
                self.parser.advance();
                self.block()
            }
            TokenKind::If => {
                self.parser.advance();
                self.if_expression()
            }
            TokenKind::While => {
                self.parser.advance();
                self.while_expression()
            }
            TokenKind::Return => {
                self.parser.advance();
                self.return_expression()
            }
            TokenKind::Ident => {
                self.parser.advance();
                self.identifier(can_assign)
            }
            _ => {
                self.parser.error_at_current("expected expression");
                ValueType::Never
            }
        }
    }

    /// A call, a local read or assignment, or a struct literal.
    fn identifier(&mut self, can_assign: bool) -> ValueType {
        let token = self.parser.previous;
        let name = self.parser.text(&token);

        if self.parser.match_kind(TokenKind::LeftParen) {
            return self.call(token);
        }

        if let Some(local) = self.function.resolve(name).cloned() {
            if can_assign && self.parser.match_kind(TokenKind::Equal) {
                return self.assignment(local, token);
            }
            self.emit(
                Instruction::LoadLocal {
                    offset: local.offset,
                    size: local.ty.size(),
                },
                token.slice(),
            );
            return local.ty;
        }

        if self.parser.check(TokenKind::LeftBrace) {
            if let Some(ty) = self.chunk.types.lookup(name) {
                self.parser.advance();
                return self.struct_literal(ty, token);
            }
        }

        self.parser
            .error_at(token.slice(), format!("undeclared variable '{}'", name));
        ValueType::Never
    }

    fn assignment(&mut self, local: Local, target: Token) -> ValueType {
        let equal = self.parser.previous.slice();
        let value = self.expression();
        if !local.mutable {
            let message = format!("cannot assign to '{}': it is declared with 'let'", local.name);
            self.parser.error_at(target.slice(), message);
        } else if value != ValueType::Never && value != local.ty {
            let message = format!(
                "cannot assign {} to '{}' of type {}",
                self.type_name(value),
                local.name,
                self.type_name(local.ty)
            );
            self.parser.error_at(equal, message);
        } else if value == local.ty {
            self.emit(
                Instruction::StoreLocal {
                    offset: local.offset,
                    size: local.ty.size(),
                },
                equal,
            );
        }
        ValueType::Unit
    }

    /// Compile a call whose `(` was just consumed.
    fn call(&mut self, callee: Token) -> ValueType {
        let name = self.parser.text(&callee);

        let mut arguments: Vec<(ValueType, Slice)> = Vec::new();
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                let start = self.parser.current.slice();
                let ty = self.expression();
                arguments.push((ty, start.merge(self.parser.previous.slice())));
                if !self.parser.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.parser.consume(TokenKind::RightParen, "expected ')' after arguments");

        let target = match self.chunk.functions.iter().position(|f| f.name == name) {
            Some(index) => Some((Instruction::Call(index), self.chunk.functions[index].type_index)),
            None => self
                .chunk
                .natives
                .iter()
                .position(|n| n.name == name)
                .map(|index| (Instruction::CallNative(index), self.chunk.natives[index].type_index)),
        };
        let Some((instruction, type_index)) = target else {
            self.parser
                .error_at(callee.slice(), format!("undeclared function '{}'", name));
            return ValueType::Never;
        };
        let Some(function_type) = self.chunk.function_types.get(type_index).cloned() else {
            return ValueType::Never;
        };

        if arguments.len() != function_type.parameters.len() {
            let message = format!(
                "function '{}' takes {} argument(s) but {} were given",
                name,
                function_type.parameters.len(),
                arguments.len()
            );
            self.parser.error_at(callee.slice(), message);
            return ValueType::Never;
        }
        for (i, ((found, slice), expected)) in arguments.iter().zip(&function_type.parameters).enumerate() {
            if *found == ValueType::Never {
                return ValueType::Never;
            }
            if found != expected {
                let message = format!(
                    "argument {} of '{}' has type {}, expected {}",
                    i + 1,
                    name,
                    self.type_name(*found),
                    self.type_name(*expected)
                );
                self.parser.error_at(*slice, message);
                return ValueType::Never;
            }
        }

        self.emit(instruction, callee.slice());
        function_type.return_type
    }

    /// Compile `Name { field: value, ... }` whose `{` was just consumed.
    /// Fields are given in declaration order.
    fn struct_literal(&mut self, ty: ValueType, name: Token) -> ValueType {
        let Some(def) = self.chunk.types.get(ty).cloned() else {
            return ValueType::Never;
        };
        for (i, field) in def.fields.iter().enumerate() {
            if i > 0 && !self.parser.consume(TokenKind::Comma, "expected ',' between fields") {
                return ValueType::Never;
            }
            if !self.parser.consume(TokenKind::Ident, &format!("expected field '{}'", field.name)) {
                return ValueType::Never;
            }
            let field_token = self.parser.previous;
            if self.parser.text(&field_token) != field.name {
                let message = format!(
                    "expected field '{}' of '{}', found '{}'",
                    field.name,
                    def.name,
                    self.parser.text(&field_token)
                );
                self.parser.error_at(field_token.slice(), message);
                return ValueType::Never;
            }
            if !self.parser.consume(TokenKind::Colon, "expected ':' after field name") {
                return ValueType::Never;
            }
            let value = self.expression();
            if value != ValueType::Never && value != field.ty {
                let message = format!(
                    "field '{}' of '{}' has type {}, found {}",
                    field.name,
                    def.name,
                    self.type_name(field.ty),
                    self.type_name(value)
                );
                self.parser.error_at(field_token.slice(), message);
            }
        }
        self.parser.match_kind(TokenKind::Comma);
        if !self.parser.consume(TokenKind::RightBrace, "expected '}' after struct fields") {
            return ValueType::Never;
        }
        self.emit(Instruction::MakeStruct(ty), name.slice());
        ty
    }

    /// Compile an `if` whose keyword was just consumed.
    fn if_expression(&mut self) -> ValueType {
        let keyword = self.parser.previous.slice();
        let condition = self.expression();
        self.expect_bool(condition, keyword, "condition of 'if'");
        let skip = self.emit(Instruction::JumpIfFalse(0), keyword);
        let base = self.function.stack_size;
        if !self.parser.consume(TokenKind::LeftBrace, "expected '{' after condition") {
            return ValueType::Never;
        }
        let then_type = self.block();

        if !self.parser.match_kind(TokenKind::Else) {
            if then_type.size() > 0 {
                let slice = self.parser.previous.slice();
                self.emit(Instruction::Pop(then_type.size()), slice);
            }
            self.patch(skip);
            self.function.stack_size = base;
            return ValueType::Unit;
        }

        let else_token = self.parser.previous.slice();
        let exit = self.emit(Instruction::Jump(0), else_token);
        self.patch(skip);
        self.function.stack_size = base;
        let else_type = if self.parser.match_kind(TokenKind::If) {
            self.if_expression()
        } else if self.parser.consume(TokenKind::LeftBrace, "expected '{' after 'else'") {
            self.block()
        } else {
            return ValueType::Never;
        };
        self.patch(exit);

        let joined = match (then_type, else_type) {
            (ValueType::Never, other) | (other, ValueType::Never) => other,
            (a, b) if a == b => a,
            (a, b) => {
                let message = format!(
                    "'if' branches have different types: {} and {}",
                    self.type_name(a),
                    self.type_name(b)
                );
                self.parser.error_at(else_token, message);
                ValueType::Never
            }
        };
        self.function.stack_size = base + joined.size();
        joined
    }

    /// Compile a `while` whose keyword was just consumed.
    fn while_expression(&mut self) -> ValueType {
        let keyword = self.parser.previous.slice();
        let start = self.chunk.len();
        let condition = self.expression();
        self.expect_bool(condition, keyword, "condition of 'while'");
        let exit = self.emit(Instruction::JumpIfFalse(0), keyword);
        if !self.parser.consume(TokenKind::LeftBrace, "expected '{' after condition") {
            return ValueType::Never;
        }
        let body = self.block();
        if body.size() > 0 {
            let slice = self.parser.previous.slice();
            self.emit(Instruction::Pop(body.size()), slice);
        }
        self.emit(Instruction::Jump(start), keyword);
        self.patch(exit);
        ValueType::Unit
    }

    /// Compile a `return` whose keyword was just consumed.
    fn return_expression(&mut self) -> ValueType {
        let keyword = self.parser.previous.slice();
        let Some(expected) = self.function.return_type else {
            self.parser
                .error_at(keyword, "'return' is only allowed inside a function");
            return ValueType::Never;
        };
        let value = if self.parser.check(TokenKind::RightBrace) || self.parser.check(TokenKind::End) {
            ValueType::Unit
        } else {
            self.expression()
        };
        if value != ValueType::Never && value != expected {
            let message = format!(
                "'return' value has type {}, expected {}",
                self.type_name(value),
                self.type_name(expected)
            );
            self.parser.error_at(keyword, message);
        }
        self.emit(Instruction::Return(expected.size()), keyword);
        ValueType::Never
    }
}
