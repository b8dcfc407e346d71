extern crate mlua;

use std::collections::BTreeMap;
use std::fmt;

/*  The marker key the select() primitive leaves on its table so the
    converter recognizes a selector list. */
pub static SELECT_MARKER : &str = "__select__";
pub static SELECT_DEFAULT : &str = "DEFAULT";

#[derive(Debug, PartialEq)]
pub enum AttrError
{
    Unsupported(String),
    FloatValue,
    MixedTable,
    NonStringKey,
    NestedSelect,
}

impl fmt::Display for AttrError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            AttrError::Unsupported(type_name) =>
                write!(formatter, "Attribute values cannot be of type: {}", type_name),

            AttrError::FloatValue =>
                write!(formatter, "Attribute numbers must be integers"),

            AttrError::MixedTable =>
                write!(formatter, "Attribute tables must be either lists or string-keyed dictionaries, not both"),

            AttrError::NonStringKey =>
                write!(formatter, "Attribute dictionary keys must be strings"),

            AttrError::NestedSelect =>
                write!(formatter, "A select() cannot appear inside another select()"),
        }
    }
}

/*  A configurable attribute: entries sorted by condition label, with an
    optional default branch.  Resolution picks the first satisfied
    condition in this canonical order. */
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorList
{
    pub entries : Vec<(String, RawValue)>,
    pub default : Option<Box<RawValue>>,
}

/*  An attribute value as it comes out of build-file evaluation, before
    coercion against the rule's schema. */
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue
{
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<RawValue>),
    Dict(BTreeMap<String, RawValue>),
    Select(SelectorList),
}

impl RawValue
{
    /*  Converts a Lua value into a RawValue.  Tables marked by the
        select() primitive become selector lists; tables with only
        positional keys become lists; tables with only string keys
        become dictionaries.  The empty table reads as the empty list. */
    pub fn from_lua(value : &mlua::Value) -> Result<RawValue, AttrError>
    {
        match value
        {
            mlua::Value::Boolean(flag) => Ok(RawValue::Bool(*flag)),

            mlua::Value::Integer(number) => Ok(RawValue::Int(*number)),

            mlua::Value::Number(number) =>
            {
                if number.fract() == 0.0
                {
                    Ok(RawValue::Int(*number as i64))
                }
                else
                {
                    Err(AttrError::FloatValue)
                }
            },

            mlua::Value::String(text) =>
            {
                match text.to_str()
                {
                    Ok(text) => Ok(RawValue::Str(text.to_string())),
                    Err(_) => Err(AttrError::Unsupported("non-utf8 string".to_string())),
                }
            },

            mlua::Value::Table(table) => RawValue::from_lua_table(table),

            other => Err(AttrError::Unsupported(other.type_name().to_string())),
        }
    }

    fn from_lua_table(table : &mlua::Table) -> Result<RawValue, AttrError>
    {
        let mut positional : Vec<(i64, RawValue)> = vec![];
        let mut named : BTreeMap<String, RawValue> = BTreeMap::new();
        let mut is_select = false;

        for pair in table.pairs::<mlua::Value, mlua::Value>()
        {
            let (key, value) =
            match pair
            {
                Ok(pair) => pair,
                Err(_) => return Err(AttrError::Unsupported("table iteration failed".to_string())),
            };

            match key
            {
                mlua::Value::Integer(index) =>
                {
                    positional.push((index, RawValue::from_lua(&value)?));
                },
                mlua::Value::String(text) =>
                {
                    let key_text =
                    match text.to_str()
                    {
                        Ok(text) => text.to_string(),
                        Err(_) => return Err(AttrError::NonStringKey),
                    };

                    if key_text == SELECT_MARKER
                    {
                        is_select = true;
                    }
                    else
                    {
                        named.insert(key_text, RawValue::from_lua(&value)?);
                    }
                },
                _ => return Err(AttrError::NonStringKey),
            }
        }

        if is_select
        {
            if positional.len() > 0
            {
                return Err(AttrError::MixedTable);
            }

            let mut entries = vec![];
            let mut default = None;
            for (condition, value) in named
            {
                match &value
                {
                    RawValue::Select(_) => return Err(AttrError::NestedSelect),
                    _ => {},
                }

                if condition == SELECT_DEFAULT
                {
                    default = Some(Box::new(value));
                }
                else
                {
                    entries.push((condition, value));
                }
            }

            /*  BTreeMap iteration already sorted the entries. */
            return Ok(RawValue::Select(SelectorList
            {
                entries : entries,
                default : default,
            }));
        }

        if positional.len() > 0 && named.len() > 0
        {
            return Err(AttrError::MixedTable);
        }

        if named.len() > 0
        {
            return Ok(RawValue::Dict(named));
        }

        positional.sort_by_key(|(index, _value)| *index);
        Ok(RawValue::List(positional.into_iter().map(|(_index, value)| value).collect()))
    }

    /*  A canonical single-line rendering, used for manifest comparison
        and duplicate detection.  Deterministic by construction: maps
        and selector entries are sorted. */
    pub fn render(&self) -> String
    {
        match self
        {
            RawValue::Bool(flag) => format!("{}", flag),
            RawValue::Int(number) => format!("{}", number),
            RawValue::Str(text) => format!("{:?}", text),

            RawValue::List(values) =>
            {
                let rendered : Vec<String> = values.iter().map(|value| value.render()).collect();
                format!("[{}]", rendered.join(", "))
            },

            RawValue::Dict(pairs) =>
            {
                let rendered : Vec<String> = pairs
                    .iter()
                    .map(|(key, value)| format!("{:?}: {}", key, value.render()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            },

            RawValue::Select(selector) =>
            {
                let mut rendered : Vec<String> = selector.entries
                    .iter()
                    .map(|(condition, value)| format!("{:?}: {}", condition, value.render()))
                    .collect();
                match &selector.default
                {
                    Some(value) => rendered.push(format!("DEFAULT: {}", value.render())),
                    None => {},
                }
                format!("select({{{}}})", rendered.join(", "))
            },
        }
    }
}

/*  The unresolved result of evaluating one target declaration in a
    build file. */
#[derive(Debug, Clone, PartialEq)]
pub struct RawTargetNode
{
    pub name : String,
    pub rule_type : String,
    pub attrs : BTreeMap<String, RawValue>,
}

impl RawTargetNode
{
    pub fn render(&self) -> String
    {
        let mut out = format!("{} {}\n", self.rule_type, self.name);
        for (key, value) in &self.attrs
        {
            out.push_str(&format!("  {} = {}\n", key, value.render()));
        }
        out
    }
}
