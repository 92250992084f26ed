use crate::error::ModelDefinitionError;
use crate::traits::VectorField;
use std::cell::RefCell;
use std::collections::HashMap;

/// Name of the time symbol available inside equations.
pub const TIME_SYMBOL: &str = "t";

/// OpCodes for the stack-based virtual machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pushes the interpolated value of a covariate (by index) onto the stack.
    LoadCovariate(usize),
    /// Pushes the current time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Abs,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// A compiled sequence of operations for one right-hand side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Largest stack depth reached while executing this bytecode.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for op in &self.ops {
            match op {
                OpCode::LoadConst(_)
                | OpCode::LoadVar(_)
                | OpCode::LoadParam(_)
                | OpCode::LoadCovariate(_)
                | OpCode::LoadTime => depth += 1,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    depth = depth.saturating_sub(1)
                }
                _ => {}
            }
            max = max.max(depth);
        }
        max
    }
}

/// Read-only inputs for one evaluation.
pub struct Frame<'a> {
    pub t: f64,
    pub vars: &'a [f64],
    pub params: &'a [f64],
    pub covariates: &'a [f64],
}

/// Stack-based virtual machine for evaluating equations.
///
/// The VM is stateless; `execute` takes the bytecode, the frame to read from
/// and a scratch stack. Bytecode produced by [`Compiler`] is always balanced,
/// so the stack never underflows.
pub struct VM;

impl VM {
    pub fn execute(bytecode: &Bytecode, frame: &Frame<'_>, stack: &mut Vec<f64>) -> f64 {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadVar(idx) => stack.push(frame.vars[idx]),
                OpCode::LoadParam(idx) => stack.push(frame.params[idx]),
                OpCode::LoadCovariate(idx) => stack.push(frame.covariates[idx]),
                OpCode::LoadTime => stack.push(frame.t),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, f64::powf),
                OpCode::Sin => unary(stack, f64::sin),
                OpCode::Cos => unary(stack, f64::cos),
                OpCode::Exp => unary(stack, f64::exp),
                OpCode::Log => unary(stack, f64::ln),
                OpCode::Sqrt => unary(stack, f64::sqrt),
                OpCode::Abs => unary(stack, f64::abs),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        // An empty or unbalanced program yields NaN, which the integrator reports.
        stack.pop().unwrap_or(f64::NAN)
    }
}

fn binary(stack: &mut Vec<f64>, f: impl Fn(f64, f64) -> f64) {
    let b = stack.pop().unwrap_or(f64::NAN);
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(f(a, b));
}

fn unary(stack: &mut Vec<f64>, f: impl Fn(f64) -> f64) {
    let a = stack.pop().unwrap_or(f64::NAN);
    stack.push(f(a));
}

// --- AST & Compiler ---

/// Abstract syntax tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),
}

/// Compiles an AST (`Expr`) into `Bytecode`, resolving names to slots.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
    pub covariate_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String], covariate_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>()
        };

        Self {
            var_map: index(var_names),
            param_map: index(param_names),
            covariate_map: index(covariate_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ModelDefinitionError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(
        &self,
        expr: &Expr,
        ops: &mut Vec<OpCode>,
    ) -> Result<(), ModelDefinitionError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let op = if let Some(&idx) = self.var_map.get(name) {
                    OpCode::LoadVar(idx)
                } else if let Some(&idx) = self.param_map.get(name) {
                    OpCode::LoadParam(idx)
                } else if let Some(&idx) = self.covariate_map.get(name) {
                    OpCode::LoadCovariate(idx)
                } else if name == TIME_SYMBOL {
                    OpCode::LoadTime
                } else {
                    return Err(ModelDefinitionError::UnknownSymbol(name.clone()));
                };
                ops.push(op);
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    other => {
                        return Err(ModelDefinitionError::Parse(format!(
                            "unknown binary operator '{other}'"
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    other => {
                        return Err(ModelDefinitionError::Parse(format!(
                            "unknown unary operator '{other}'"
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "log" => OpCode::Log,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => return Err(ModelDefinitionError::UnknownFunction(func.clone())),
                });
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ModelDefinitionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ModelDefinitionError::Parse("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(ModelDefinitionError::Parse(format!(
            "unexpected trailing token {token:?}"
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ModelDefinitionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(|ch| ch == 'e' || ch == 'E') {
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| ModelDefinitionError::Parse(format!("invalid number '{num_str}'")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(ModelDefinitionError::Parse(format!(
                        "unexpected character '{other}'"
                    )))
                }
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // expression := term (('+' | '-') term)*
    fn parse_expression(&mut self) -> Result<Expr, ModelDefinitionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // term := unary (('*' | '/') unary)*
    fn parse_term(&mut self) -> Result<Expr, ModelDefinitionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // unary := '-' unary | power
    fn parse_unary(&mut self) -> Result<Expr, ModelDefinitionError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // power := primary ('^' unary)?   (right associative, binds tighter than unary minus)
    fn parse_power(&mut self) -> Result<Expr, ModelDefinitionError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ModelDefinitionError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(ModelDefinitionError::Parse(format!(
                "unexpected token {token:?}"
            ))),
            None => Err(ModelDefinitionError::Parse(
                "unexpected end of expression".to_string(),
            )),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ModelDefinitionError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ModelDefinitionError::Parse("expected ')'".to_string())),
        }
    }
}

// --- EquationSystem ---

/// Largest [`Bytecode::max_stack_depth`] over `equations`.
pub fn deepest_stack(equations: &[Bytecode]) -> usize {
    equations
        .iter()
        .map(Bytecode::max_stack_depth)
        .max()
        .unwrap_or(0)
}

thread_local! {
    static VM_STACK: RefCell<Vec<f64>> = RefCell::new(Vec::with_capacity(64));
}

/// A `VectorField` backed by compiled equations, one per state variable.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    stack_depth: usize,
}

impl EquationSystem {
    pub fn new(equations: Vec<Bytecode>) -> Self {
        let stack_depth = deepest_stack(&equations);
        Self {
            equations,
            stack_depth,
        }
    }

    /// Scratch stack size needed by the deepest equation.
    pub fn stack_depth(&self) -> usize {
        self.stack_depth
    }

    /// Parses and compiles one equation per state variable.
    pub fn compile(
        equations: &[&str],
        var_names: &[String],
        param_names: &[String],
        covariate_names: &[String],
    ) -> Result<Self, ModelDefinitionError> {
        let compiler = Compiler::new(var_names, param_names, covariate_names);
        let bytecodes = equations
            .iter()
            .map(|text| parse(text).and_then(|expr| compiler.compile(&expr)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(bytecodes))
    }
}

impl VectorField for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: f64, x: &[f64], params: &[f64], covariates: &[f64], out: &mut [f64]) {
        let frame = Frame {
            t,
            vars: x,
            params,
            covariates,
        };
        // One scratch stack per thread keeps the system `Sync` without allocating per call.
        VM_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.clear();
            stack.reserve(self.stack_depth);
            for (slot, eq) in out.iter_mut().zip(&self.equations) {
                *slot = VM::execute(eq, &frame, &mut stack);
            }
        });
    }
}
