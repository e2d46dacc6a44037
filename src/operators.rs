/*!
 * @file operators.rs
 * @brief Closed operator tables mapping pipeline tokens to SQL traits
 */

/// Comparison operators usable in filter and expression context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn sql_symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
    Nor,
}

impl LogicalOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$and" => Some(Self::And),
            "$or" => Some(Self::Or),
            "$not" => Some(Self::Not),
            "$nor" => Some(Self::Nor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Round,
    Abs,
    Ceil,
    Floor,
    Trunc,
    Sqrt,
    Pow,
    Exp,
    Ln,
    Log10,
    Max,
    Min,
}

impl ArithmeticOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$add" => Some(Self::Add),
            "$subtract" => Some(Self::Subtract),
            "$multiply" => Some(Self::Multiply),
            "$divide" => Some(Self::Divide),
            "$mod" => Some(Self::Mod),
            "$round" => Some(Self::Round),
            "$abs" => Some(Self::Abs),
            "$ceil" => Some(Self::Ceil),
            "$floor" => Some(Self::Floor),
            "$trunc" => Some(Self::Trunc),
            "$sqrt" => Some(Self::Sqrt),
            "$pow" => Some(Self::Pow),
            "$exp" => Some(Self::Exp),
            "$ln" => Some(Self::Ln),
            "$log10" => Some(Self::Log10),
            "$max" => Some(Self::Max),
            "$min" => Some(Self::Min),
            _ => None,
        }
    }

    /// Infix operators chain operands with a symbol; the rest render as
    /// function calls.
    pub fn infix_symbol(&self) -> Option<&'static str> {
        match self {
            Self::Add => Some("+"),
            Self::Subtract => Some("-"),
            Self::Multiply => Some("*"),
            Self::Divide => Some("/"),
            _ => None,
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide => "",
            Self::Mod => "MOD",
            Self::Round => "ROUND",
            Self::Abs => "ABS",
            Self::Ceil => "CEIL",
            Self::Floor => "FLOOR",
            Self::Trunc => "TRUNC",
            Self::Sqrt => "SQRT",
            Self::Pow => "POWER",
            Self::Exp => "EXP",
            Self::Ln => "LN",
            Self::Log10 => "LOG10",
            Self::Max => "GREATEST",
            Self::Min => "LEAST",
        }
    }

    pub fn allows_single_operand(&self) -> bool {
        matches!(
            self,
            Self::Abs | Self::Ceil | Self::Floor | Self::Sqrt | Self::Exp | Self::Ln | Self::Log10 | Self::Trunc | Self::Round
        )
    }

    /// (min, max) operand count; max of `usize::MAX` means unbounded.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Self::Abs | Self::Ceil | Self::Floor | Self::Sqrt | Self::Exp | Self::Ln | Self::Log10 => (1, 1),
            Self::Round | Self::Trunc => (1, 2),
            Self::Subtract | Self::Divide | Self::Mod | Self::Pow => (2, 2),
            Self::Add | Self::Multiply | Self::Max | Self::Min => (1, usize::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    ToUpper,
    ToLower,
    Trim,
    Ltrim,
    Rtrim,
    StrLen,
    Concat,
    Substr,
    Split,
    IndexOf,
}

impl StringOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$toUpper" => Some(Self::ToUpper),
            "$toLower" => Some(Self::ToLower),
            "$trim" => Some(Self::Trim),
            "$ltrim" => Some(Self::Ltrim),
            "$rtrim" => Some(Self::Rtrim),
            "$strLenCP" | "$strLenBytes" => Some(Self::StrLen),
            "$concat" => Some(Self::Concat),
            "$substr" | "$substrCP" | "$substrBytes" => Some(Self::Substr),
            "$split" => Some(Self::Split),
            "$indexOfCP" | "$indexOfBytes" => Some(Self::IndexOf),
            _ => None,
        }
    }

    pub fn takes_single_argument(&self) -> bool {
        matches!(self, Self::ToUpper | Self::ToLower | Self::Trim | Self::Ltrim | Self::Rtrim | Self::StrLen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOp {
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
    DayOfWeek,
    DayOfYear,
}

impl DateOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$year" => Some(Self::Year),
            "$month" => Some(Self::Month),
            "$dayOfMonth" => Some(Self::DayOfMonth),
            "$hour" => Some(Self::Hour),
            "$minute" => Some(Self::Minute),
            "$second" => Some(Self::Second),
            "$dayOfWeek" => Some(Self::DayOfWeek),
            "$dayOfYear" => Some(Self::DayOfYear),
            _ => None,
        }
    }

    /// EXTRACT field name, or None for the TO_CHAR-based operators.
    pub fn extract_field(&self) -> Option<&'static str> {
        match self {
            Self::Year => Some("YEAR"),
            Self::Month => Some("MONTH"),
            Self::DayOfMonth => Some("DAY"),
            Self::Hour => Some("HOUR"),
            Self::Minute => Some("MINUTE"),
            Self::Second => Some("SECOND"),
            Self::DayOfWeek | Self::DayOfYear => None,
        }
    }

    pub fn to_char_format(&self) -> Option<&'static str> {
        match self {
            Self::DayOfWeek => Some("D"),
            Self::DayOfYear => Some("DDD"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOp {
    ElemAt,
    Size,
    First,
    Last,
    ConcatArrays,
    Slice,
}

impl ArrayOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$arrayElemAt" => Some(Self::ElemAt),
            "$size" => Some(Self::Size),
            "$first" => Some(Self::First),
            "$last" => Some(Self::Last),
            "$concatArrays" => Some(Self::ConcatArrays),
            "$slice" => Some(Self::Slice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

impl AccumulatorOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$sum" => Some(Self::Sum),
            "$avg" => Some(Self::Avg),
            "$count" => Some(Self::Count),
            "$min" => Some(Self::Min),
            "$max" => Some(Self::Max),
            "$first" => Some(Self::First),
            "$last" => Some(Self::Last),
            "$push" => Some(Self::Push),
            "$addToSet" => Some(Self::AddToSet),
            _ => None,
        }
    }
}

/// Window operators for `$setWindowFields` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOp {
    Rank,
    DenseRank,
    DocumentNumber,
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl WindowOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$rank" => Some(Self::Rank),
            "$denseRank" => Some(Self::DenseRank),
            "$documentNumber" => Some(Self::DocumentNumber),
            "$sum" => Some(Self::Sum),
            "$avg" => Some(Self::Avg),
            "$min" => Some(Self::Min),
            "$max" => Some(Self::Max),
            "$count" => Some(Self::Count),
            _ => None,
        }
    }

    pub fn sql_function(&self) -> &'static str {
        match self {
            Self::Rank => "RANK",
            Self::DenseRank => "DENSE_RANK",
            Self::DocumentNumber => "ROW_NUMBER",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }

    /// Ranking functions take no argument and accept no frame clause.
    pub fn is_ranking(&self) -> bool {
        matches!(self, Self::Rank | Self::DenseRank | Self::DocumentNumber)
    }
}

/// Targets of the `$convert`/`$toX` conversion family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionTarget {
    Int,
    Long,
    Double,
    Decimal,
    String,
    Bool,
    Date,
}

impl ConversionTarget {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$toInt" => Some(Self::Int),
            "$toLong" => Some(Self::Long),
            "$toDouble" => Some(Self::Double),
            "$toDecimal" => Some(Self::Decimal),
            "$toString" => Some(Self::String),
            "$toBool" => Some(Self::Bool),
            "$toDate" => Some(Self::Date),
            _ => None,
        }
    }

    /// Mongo type-name form used by the `$convert` `to` argument.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "double" => Some(Self::Double),
            "decimal" => Some(Self::Decimal),
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}
